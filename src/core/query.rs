//! Read requests, aggregation and qualification types

use super::{duration::parse_duration, parse_timestamp, UrlParams};
use crate::error::{MortarError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Reduction applied per time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Mean,
    Max,
    Min,
    Sum,
    Count,
}

impl AggregationFunction {
    /// Name of the matching SQL aggregate.
    pub fn sql_name(self) -> &'static str {
        match self {
            AggregationFunction::Mean => "avg",
            AggregationFunction::Max => "max",
            AggregationFunction::Min => "min",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Count => "count",
        }
    }
}

impl FromStr for AggregationFunction {
    type Err = MortarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(AggregationFunction::Mean),
            "max" => Ok(AggregationFunction::Max),
            "min" => Ok(AggregationFunction::Min),
            "sum" => Ok(AggregationFunction::Sum),
            "count" => Ok(AggregationFunction::Count),
            _ => Err(MortarError::Validation(format!("Aggregation type {} unknown", s))),
        }
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationFunction::Mean => "mean",
            AggregationFunction::Max => "max",
            AggregationFunction::Min => "min",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Count => "count",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationSpec {
    pub function: AggregationFunction,
    pub window: Duration,
}

impl AggregationSpec {
    pub fn new(function: AggregationFunction, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(MortarError::Validation("Aggregation window must be positive".to_string()));
        }
        Ok(Self { function, window })
    }
}

/// A client read request.
///
/// Exactly one of `sparql`, `uris` or `ids` drives resolution, in that order of precedence.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub ids: Vec<i64>,
    pub uris: Vec<String>,
    pub sparql: String,
    pub sources: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub aggregation: Option<AggregationSpec>,
}

/// The strategy that resolves a [`Query`] to stream ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueryTarget<'a> {
    Sparql(&'a str),
    Uris(&'a [String]),
    Ids(&'a [i64]),
}

impl Query {
    /// Query over explicit stream ids.
    pub fn for_ids(ids: Vec<i64>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            ids,
            uris: Vec::new(),
            sparql: String::new(),
            sources: Vec::new(),
            start,
            end,
            aggregation: None,
        }
    }

    pub fn for_uris(uris: Vec<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { uris, ..Self::for_ids(Vec::new(), start, end) }
    }

    pub fn for_sparql(sparql: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { sparql: sparql.to_string(), ..Self::for_ids(Vec::new(), start, end) }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_aggregation(mut self, spec: AggregationSpec) -> Self {
        self.aggregation = Some(spec);
        self
    }

    pub fn target(&self) -> QueryTarget<'_> {
        if !self.sparql.trim().is_empty() {
            QueryTarget::Sparql(&self.sparql)
        } else if !self.uris.is_empty() {
            QueryTarget::Uris(&self.uris)
        } else {
            QueryTarget::Ids(&self.ids)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.end < self.start {
            return Err(MortarError::Validation(format!(
                "Query end {} is before start {}",
                self.end.to_rfc3339(),
                self.start.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Build a query from `id`, `uri`, `sparql`, `source`, `start`, `end`, `agg` and `window`.
    pub fn from_params(params: &UrlParams) -> Result<Self> {
        let sparql = params.get("sparql").unwrap_or_default().to_string();
        let uris: Vec<String> =
            params.get_all("uri").into_iter().filter(|u| !u.is_empty()).map(String::from).collect();

        if !params.contains("id") && uris.is_empty() && sparql.trim().is_empty() {
            return Err(MortarError::Validation("Query needs ids".to_string()));
        }
        let ids = params
            .get_all("id")
            .into_iter()
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|e| MortarError::Validation(format!("Invalid id {}: {}", raw, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let start = match params.get_non_empty("start") {
            Some(raw) => parse_timestamp(raw).map_err(|e| e.context("Invalid start time"))?,
            None => {
                return Err(MortarError::Validation(
                    "Query needs a start time in RFC3339".to_string(),
                ))
            }
        };
        let end = match params.get_non_empty("end") {
            Some(raw) => parse_timestamp(raw).map_err(|e| e.context("Invalid end time"))?,
            None => Utc::now(),
        };

        let function = params
            .get_non_empty("agg")
            .map(|raw| raw.parse::<AggregationFunction>())
            .transpose()
            .map_err(|e| e.context("Invalid aggregation function"))?;
        let window = params
            .get_non_empty("window")
            .map(|raw| parse_duration(raw).map_err(|e| e.context("Invalid window size")))
            .transpose()?;
        let aggregation = match (function, window) {
            (Some(function), Some(window)) => Some(AggregationSpec::new(function, window)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(MortarError::Validation(
                    "Aggregation function requires a window".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(MortarError::Validation(
                    "Aggregation window requires a function".to_string(),
                ))
            }
        };

        let query = Self {
            ids,
            uris,
            sparql,
            sources: params.get_all("source").into_iter().map(String::from).collect(),
            start,
            end,
            aggregation,
        };
        query.validate()?;
        Ok(query)
    }
}

/// Per-graph match counts, index-aligned with the submitted queries.
pub type QualifyResult = BTreeMap<String, Vec<usize>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> UrlParams {
        UrlParams::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_query_from_params_with_ids() {
        let q = Query::from_params(&params(&[
            ("id", "1"),
            ("id", "7"),
            ("start", "2020-01-01T00:00:00Z"),
            ("end", "2020-01-02T00:00:00Z"),
            ("agg", "MEAN"),
            ("window", "1h"),
        ]))
        .unwrap();
        assert_eq!(q.target(), QueryTarget::Ids(&[1, 7]));
        let agg = q.aggregation.unwrap();
        assert_eq!(agg.function, AggregationFunction::Mean);
        assert_eq!(agg.window, Duration::from_secs(3600));
    }

    #[test]
    fn test_query_requires_target_and_start() {
        let err = Query::from_params(&params(&[("start", "2020-01-01T00:00:00Z")])).unwrap_err();
        assert!(err.to_string().contains("Query needs ids"));

        let err = Query::from_params(&params(&[("id", "1")])).unwrap_err();
        assert!(err.to_string().contains("start time"));
    }

    #[test]
    fn test_query_rejects_half_aggregation() {
        let err = Query::from_params(&params(&[
            ("id", "1"),
            ("start", "2020-01-01T00:00:00Z"),
            ("agg", "max"),
        ]))
        .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_query_rejects_reversed_range() {
        let err = Query::from_params(&params(&[
            ("id", "1"),
            ("start", "2020-01-02T00:00:00Z"),
            ("end", "2020-01-01T00:00:00Z"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("before start"));
    }

    #[test]
    fn test_target_precedence() {
        let start = Utc::now();
        let mut q = Query::for_ids(vec![3], start, start);
        q.uris = vec!["http://ex.org/a".to_string()];
        assert!(matches!(q.target(), QueryTarget::Uris(_)));
        q.sparql = "SELECT ?s WHERE { ?s ?p ?o }".to_string();
        assert!(matches!(q.target(), QueryTarget::Sparql(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(AggregationSpec::new(AggregationFunction::Sum, Duration::ZERO).is_err());
    }
}
