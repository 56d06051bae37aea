//! Datasets: pull-based sources of rows for the bulk loader.
//!
//! A reading [`Dataset`] is bound to one catalog stream. The loader resolves the
//! stream's id, binds it with [`Dataset::set_id`], then repeatedly calls
//! [`Dataset::advance`] followed by [`Dataset::current`] until `advance` reports
//! the end. A [`TripleDataset`] follows the same protocol for ontology statements.

use crate::core::{ReadingRow, TripleRecord};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod array;
pub mod feed;
pub mod parsers;
pub mod streaming;
pub mod triples;

pub use array::ArrayDataset;
pub use feed::{feed, FeedReceiver, FeedSender};
pub use parsers::{spawn_csv_parser, spawn_rdf_parser};
pub use streaming::StreamingDataset;
pub use triples::{ArrayTripleDataset, StreamingTripleDataset};

/// A consumable sequence of readings destined for one stream.
#[async_trait]
pub trait Dataset: Send {
    fn source_name(&self) -> &str;

    fn name(&self) -> &str;

    /// Bind the resolved stream id. Binding twice is an error.
    fn set_id(&mut self, id: i64) -> Result<()>;

    /// Move to the next reading; false once the sequence is exhausted.
    async fn advance(&mut self) -> Result<bool>;

    /// The reading under the cursor as a `(time, id, value)` row.
    fn current(&self) -> Result<ReadingRow>;

    /// A failure reported by the dataset's producer, if any.
    fn take_failure(&mut self) -> Option<MortarError> {
        None
    }

    fn check(&self) -> Result<()> {
        if self.source_name().is_empty() {
            return Err(MortarError::Validation("SourceName is null".to_string()));
        }
        if self.name().is_empty() {
            return Err(MortarError::Validation("Name is null".to_string()));
        }
        Ok(())
    }
}

/// A consumable sequence of ontology statements from one upload.
#[async_trait]
pub trait TripleDataset: Send {
    fn source(&self) -> &str;

    fn origin(&self) -> &str;

    fn time(&self) -> DateTime<Utc>;

    async fn advance(&mut self) -> Result<bool>;

    fn current(&self) -> Result<TripleRecord>;

    fn take_failure(&mut self) -> Option<MortarError> {
        None
    }

    fn check(&self) -> Result<()> {
        if self.source().is_empty() {
            return Err(MortarError::Validation("Source is null".to_string()));
        }
        if self.origin().is_empty() {
            return Err(MortarError::Validation("Origin is null".to_string()));
        }
        Ok(())
    }
}

/// Shared guard for "id may be bound exactly once".
pub(crate) fn bind_once(slot: &mut Option<i64>, id: i64, source: &str, name: &str) -> Result<()> {
    match slot {
        Some(existing) => Err(MortarError::Internal(format!(
            "Dataset ({}, {}) already bound to id {}",
            source, name, existing
        ))),
        None => {
            *slot = Some(id);
            Ok(())
        }
    }
}

pub(crate) fn require_id(slot: Option<i64>) -> Result<i64> {
    slot.ok_or_else(|| MortarError::Internal("Need to set ID".to_string()))
}
