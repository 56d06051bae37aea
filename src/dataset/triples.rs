use super::{feed, FeedReceiver, FeedSender, TripleDataset};
use crate::core::{TripleFormat, TripleRecord};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxigraph::io::RdfParser;
use oxigraph::model::Quad;

/// Subject, predicate and object of one statement in N-Triples form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTerms {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl StatementTerms {
    /// Graph names are ignored: an upload's provenance is its source.
    pub fn from_quad(quad: &Quad) -> Self {
        Self {
            subject: quad.subject.to_string(),
            predicate: quad.predicate.to_string(),
            object: quad.object.to_string(),
        }
    }

    fn into_record(self, source: &str, origin: &str, time: DateTime<Utc>) -> TripleRecord {
        TripleRecord {
            source: source.to_string(),
            origin: origin.to_string(),
            time,
            subject: self.subject,
            predicate: self.predicate,
            object: self.object,
        }
    }
}

/// Statements held in memory.
#[derive(Debug, Clone)]
pub struct ArrayTripleDataset {
    source: String,
    origin: String,
    time: DateTime<Utc>,
    statements: Vec<StatementTerms>,
    cursor: Option<usize>,
}

impl ArrayTripleDataset {
    pub fn from_terms(
        source: &str,
        origin: &str,
        time: DateTime<Utc>,
        statements: Vec<StatementTerms>,
    ) -> Self {
        Self {
            source: source.to_string(),
            origin: origin.to_string(),
            time,
            statements,
            cursor: None,
        }
    }

    /// Parse a complete document.
    pub fn parse(
        source: &str,
        origin: &str,
        time: DateTime<Utc>,
        format: TripleFormat,
        document: &[u8],
    ) -> Result<Self> {
        let statements = RdfParser::from_format(format.rdf_format())
            .for_slice(document)
            .map(|quad| quad.map(|q| StatementTerms::from_quad(&q)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::from_terms(source, origin, time, statements))
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[async_trait]
impl TripleDataset for ArrayTripleDataset {
    fn source(&self) -> &str {
        &self.source
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    async fn advance(&mut self) -> Result<bool> {
        let next = self.cursor.map_or(0, |c| c + 1).min(self.statements.len());
        self.cursor = Some(next);
        Ok(next < self.statements.len())
    }

    fn current(&self) -> Result<TripleRecord> {
        self.cursor
            .and_then(|c| self.statements.get(c))
            .cloned()
            .map(|terms| terms.into_record(&self.source, &self.origin, self.time))
            .ok_or_else(|| MortarError::Internal("No value".to_string()))
    }
}

/// Statements pushed one at a time by a parser task.
#[derive(Debug)]
pub struct StreamingTripleDataset {
    source: String,
    origin: String,
    time: DateTime<Utc>,
    statements: FeedReceiver<StatementTerms>,
    current: Option<StatementTerms>,
}

impl StreamingTripleDataset {
    pub fn channel(
        source: &str,
        origin: &str,
        time: DateTime<Utc>,
    ) -> (FeedSender<StatementTerms>, Self) {
        let (tx, rx) = feed();
        let ds = Self {
            source: source.to_string(),
            origin: origin.to_string(),
            time,
            statements: rx,
            current: None,
        };
        (tx, ds)
    }
}

#[async_trait]
impl TripleDataset for StreamingTripleDataset {
    fn source(&self) -> &str {
        &self.source
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    async fn advance(&mut self) -> Result<bool> {
        self.current = self.statements.next().await?;
        Ok(self.current.is_some())
    }

    fn current(&self) -> Result<TripleRecord> {
        self.current
            .clone()
            .map(|terms| terms.into_record(&self.source, &self.origin, self.time))
            .ok_or_else(|| MortarError::Internal("No value".to_string()))
    }

    fn take_failure(&mut self) -> Option<MortarError> {
        self.statements.take_failure()
    }
}
