//! Core data structures and types for the Mortar data engine

use crate::error::{MortarError, Result};
use chrono::{DateTime, Utc};
use oxigraph::model::NamedNode;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;

pub mod duration;
pub mod params;
pub mod query;

pub use duration::parse_duration;
pub use params::UrlParams;
pub use query::*;

/// Default ontology class asserted for streams registered without one
pub const DEFAULT_POINT_CLASS: &str = "https://brickschema.org/schema/Brick#Point";

/// `rdf:type`
pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

/// Provenance label of statements derived from stream registration
pub const REGISTRATION_ORIGIN: &str = "stream_registration";

/// Catalog entry for one named timeseries.
///
/// `(source_name, name)` identifies the entry; the store assigns its internal id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    #[serde(alias = "SourceName", default)]
    pub source_name: String,
    #[serde(alias = "Name", default)]
    pub name: String,
    #[serde(alias = "Units", default)]
    pub units: String,
    #[serde(alias = "BrickURI", default, skip_serializing_if = "Option::is_none")]
    pub brick_uri: Option<String>,
    #[serde(alias = "BrickClass", default, skip_serializing_if = "Option::is_none")]
    pub brick_class: Option<String>,
}

impl Stream {
    pub fn new(source_name: &str, name: &str, units: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            name: name.to_string(),
            units: units.to_string(),
            brick_uri: None,
            brick_class: None,
        }
    }

    pub fn with_brick_uri(mut self, uri: &str) -> Self {
        self.brick_uri = Some(uri.to_string());
        self
    }

    pub fn with_brick_class(mut self, class: &str) -> Self {
        self.brick_class = Some(class.to_string());
        self
    }

    /// Ontology URI, treating an empty string as absent.
    pub fn uri(&self) -> Option<&str> {
        self.brick_uri.as_deref().filter(|u| !u.is_empty())
    }

    /// Ontology class, treating an empty string as absent.
    pub fn class(&self) -> Option<&str> {
        self.brick_class.as_deref().filter(|c| !c.is_empty())
    }

    /// Fill the stream from URL parameters. `source` and `name` are mandatory unless
    /// already set; `units`, `brick_uri` and `brick_class` are optional.
    pub fn from_params(params: &UrlParams) -> Result<Self> {
        let mut stream = Stream::default();
        stream.apply_params(params)?;
        Ok(stream)
    }

    pub fn apply_params(&mut self, params: &UrlParams) -> Result<()> {
        match params.get_non_empty("source") {
            Some(source) => self.source_name = source.to_string(),
            None if self.source_name.is_empty() => {
                return Err(MortarError::Validation("Params lacks 'source'".to_string()))
            }
            None => {}
        }
        match params.get_non_empty("name") {
            Some(name) => self.name = name.to_string(),
            None if self.name.is_empty() => {
                return Err(MortarError::Validation("Params lacks 'name'".to_string()))
            }
            None => {}
        }
        if let Some(units) = params.get_non_empty("units") {
            self.units = units.to_string();
        }
        if let Some(uri) = params.get_non_empty("brick_uri") {
            self.brick_uri = Some(uri.to_string());
        }
        if let Some(class) = params.get_non_empty("brick_class") {
            self.brick_class = Some(class.to_string());
        }
        Ok(())
    }

    /// Checks the required fields and that any ontology reference is a valid IRI.
    pub fn validate(&self) -> Result<()> {
        if self.source_name.is_empty() {
            return Err(MortarError::Validation("SourceName is null".to_string()));
        }
        if self.units.is_empty() {
            return Err(MortarError::Validation("Units is null".to_string()));
        }
        if self.name.is_empty() {
            return Err(MortarError::Validation("Name is null".to_string()));
        }
        if let Some(uri) = self.uri() {
            NamedNode::new(uri).map_err(|e| {
                MortarError::Validation(format!("BrickURI '{}' is invalid: {}", uri, e))
            })?;
        }
        if let Some(class) = self.class() {
            NamedNode::new(class).map_err(|e| {
                MortarError::Validation(format!("BrickClass '{}' is invalid: {}", class, e))
            })?;
        }
        Ok(())
    }

    /// Statement `<uri> rdf:type <class>` implied by registering this stream, if it has a URI.
    pub fn type_statement(&self, time: DateTime<Utc>) -> Option<TripleRecord> {
        let uri = self.uri()?;
        Some(TripleRecord {
            source: self.source_name.clone(),
            origin: REGISTRATION_ORIGIN.to_string(),
            time,
            subject: format!("<{}>", uri),
            predicate: format!("<{}>", RDF_TYPE),
            object: format!("<{}>", self.class().unwrap_or(DEFAULT_POINT_CLASS)),
        })
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stream[SourceName={}, Name={}, Units={}, BrickURI={}, BrickClass={}]",
            self.source_name,
            self.name,
            self.units,
            self.uri().unwrap_or(""),
            self.class().unwrap_or("")
        )
    }
}

/// One timestamped scalar sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub time: DateTime<Utc>,
    pub value: f64,
}

impl Reading {
    pub fn new(time: DateTime<Utc>, value: f64) -> Self {
        Self { time, value }
    }

    /// Parse a `timestamp,value` CSV row.
    pub fn from_csv_record(record: &csv::StringRecord) -> Result<Self> {
        if record.len() != 2 {
            return Err(MortarError::Validation(format!(
                "Row must have 2 fields, found {}",
                record.len()
            )));
        }
        let (ts, value) = (&record[0], &record[1]);
        let time = parse_timestamp(ts.trim()).map_err(|_| {
            MortarError::Validation("First item must be a RFC3339 timestamp".to_string())
        })?;
        let value = value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| MortarError::Validation("Second item must be a float".to_string()))?;
        Ok(Self { time, value })
    }
}

/// Readings travel as `[RFC3339 string, number]`.
impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (ts, value) = <(serde_json::Value, serde_json::Value)>::deserialize(deserializer)?;
        let time = ts
            .as_str()
            .and_then(|s| parse_timestamp(s).ok())
            .ok_or_else(|| de::Error::custom("First item must be a RFC3339 timestamp"))?;
        let value = value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| de::Error::custom("Second item must be a number"))?;
        Ok(Reading { time, value })
    }
}

impl Serialize for Reading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.time.to_rfc3339(), self.value).serialize(serializer)
    }
}

/// Parse an RFC3339 timestamp into UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MortarError::Validation(format!("Invalid RFC3339 timestamp '{}': {}", s, e)))
}

/// One element handed to the bulk loader: `(time, stream id, value)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadingRow {
    pub time: DateTime<Utc>,
    pub stream_id: i64,
    pub value: f64,
}

/// One ontology statement with provenance. Terms are kept in N-Triples form
/// (`<iri>`, `"literal"^^<dt>`, `_:b0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TripleRecord {
    pub source: String,
    pub origin: String,
    pub time: DateTime<Utc>,
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Serialization formats accepted for statement uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TripleFormat {
    #[default]
    Turtle,
    NTriples,
    RdfXml,
}

impl TripleFormat {
    /// Unknown names fall back to Turtle.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "ntriples" | "n3" => TripleFormat::NTriples,
            "xml" | "rdfxml" => TripleFormat::RdfXml,
            _ => TripleFormat::Turtle,
        }
    }

    pub fn rdf_format(self) -> oxigraph::io::RdfFormat {
        match self {
            TripleFormat::Turtle => oxigraph::io::RdfFormat::Turtle,
            TripleFormat::NTriples => oxigraph::io::RdfFormat::NTriples,
            TripleFormat::RdfXml => oxigraph::io::RdfFormat::RdfXml,
        }
    }
}

/// Provenance of a statement upload, read from URL parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TripleSource {
    pub source: String,
    pub origin: String,
    pub format: TripleFormat,
    pub time: DateTime<Utc>,
}

impl TripleSource {
    pub fn from_params(params: &UrlParams) -> Result<Self> {
        let source = params
            .get_non_empty("source")
            .ok_or_else(|| MortarError::Validation("Params lacks 'source'".to_string()))?;
        let origin = params
            .get_non_empty("origin")
            .ok_or_else(|| MortarError::Validation("Params lacks 'origin'".to_string()))?;
        let format = params.get_non_empty("format").map(TripleFormat::from_name).unwrap_or_default();
        let time = match params.get_non_empty("time") {
            Some(t) => parse_timestamp(t)?,
            None => Utc::now(),
        };
        Ok(Self { source: source.to_string(), origin: origin.to_string(), format, time })
    }
}

/// One row of the metadata section of a read response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetadata {
    pub brick_class: Option<String>,
    pub brick_uri: Option<String>,
    pub units: Option<String>,
    pub name: Option<String>,
    pub stream_id: i64,
}

/// One row of the data section: a (possibly aggregated) value with its display label.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub time: DateTime<Utc>,
    pub value: f64,
    /// Ontology URI when the stream has one, otherwise its name
    pub label: String,
}
