//! Relational store abstraction.
//!
//! The engine talks to its store through two traits: [`Store`] for pooled,
//! non-transactional reads and for opening transactions, and [`StoreTransaction`]
//! for everything that writes. Two implementations are provided:
//! [`postgres::PostgresStore`] over TimescaleDB and [`memory::MemoryStore`].

use crate::core::{AggregationSpec, DataRow, Stream, StreamMetadata, TripleRecord};
use crate::dataset::{Dataset, TripleDataset};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

pub mod memory;
pub mod postgres;
pub mod transaction;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use transaction::{run_as_transaction, UnitOfWork};

/// Transaction-scoped bulk-load tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingTable {
    /// `(time, stream_id, value)`
    Readings,
    /// `(source, origin, time, s, p, o)`
    Statements,
}

impl StagingTable {
    pub fn table_name(self) -> &'static str {
        match self {
            StagingTable::Readings => "datat",
            StagingTable::Statements => "triplet",
        }
    }
}

/// A time-range read over resolved stream ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub ids: Vec<i64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub aggregation: Option<AggregationSpec>,
}

/// Rows of a scan, ordered by (stream id, time).
pub type DataRowStream = BoxStream<'static, Result<DataRow>>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Acquire a pooled connection and open a transaction on it.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Ids of streams whose name or ontology URI is one of `labels`, restricted to
    /// `sources` when that is non-empty. Sorted ascending.
    async fn resolve_ids(&self, labels: &[String], sources: &[String]) -> Result<Vec<i64>>;

    /// Catalog rows for exactly `ids`, ordered by id. Unknown ids are skipped.
    async fn stream_metadata(&self, ids: &[i64]) -> Result<Vec<StreamMetadata>>;

    /// Time-range scan, or a time-bucketed reduction when `request.aggregation` is set.
    async fn scan(&self, request: &ScanRequest) -> Result<DataRowStream>;

    /// Every distinct statement source ("graph") recorded so far, sorted.
    async fn graphs(&self) -> Result<Vec<String>>;

    /// Stored statements, optionally for one source.
    async fn statements(&self, source: Option<&str>) -> Result<Vec<TripleRecord>>;

    async fn close(&self);
}

/// An open transaction. Dropping it without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert or update the catalog row for `(source, name)`. True when newly created.
    async fn upsert_stream(&mut self, stream: &Stream) -> Result<bool>;

    /// Insert `record` unless a statement with the same source, subject, predicate
    /// and object already exists. True when inserted.
    async fn assert_statement(&mut self, record: &TripleRecord) -> Result<bool>;

    async fn stream_id(&mut self, source: &str, name: &str) -> Result<Option<i64>>;

    async fn create_staging_table(&mut self, table: StagingTable) -> Result<()>;

    /// Bulk-copy every row `dataset` yields into the readings staging table.
    async fn copy_readings(&mut self, dataset: &mut dyn Dataset) -> Result<u64>;

    /// Bulk-copy every statement `dataset` yields into the statements staging table.
    async fn copy_statements(&mut self, dataset: &mut dyn TripleDataset) -> Result<u64>;

    /// Merge staged rows into the permanent relation. Readings upsert by
    /// (time, stream id) with the last staged value winning; statements are
    /// inserted only if absent. Returns the number of rows written.
    async fn merge_staging_table(&mut self, table: StagingTable) -> Result<u64>;

    async fn drop_staging_table(&mut self, table: StagingTable) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
