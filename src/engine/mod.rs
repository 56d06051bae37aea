//! The data engine.
//!
//! [`Engine`] exposes the five logical operations of the platform
//! (`register_stream`, `insert_historical_data`, `add_triples`, `read_data_chunk`
//! and `qualify`) plus a few read-only helpers. Each operation runs inside its own
//! timeout-derived [`Context`]; writes go through [`run_as_transaction`].

use crate::config::{TimeoutConfig, DEFAULT_READ_BATCH_ROWS};
use crate::context::Context;
use crate::core::{QualifyResult, Query, Stream, TripleRecord};
use crate::dataset::{Dataset, TripleDataset};
use crate::encoding::{self, DataBatchWriter};
use crate::error::{MortarError, Result};
use crate::reasoner::Reasoner;
use crate::storage::{run_as_transaction, ScanRequest, StagingTable, Store, StoreTransaction, UnitOfWork};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

mod qualify;
pub mod resolution;

/// Rows moved by one ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestSummary {
    /// Rows copied into the staging table
    pub copied: u64,
    /// Rows written to the permanent relation
    pub merged: u64,
}

/// What one read response contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReadSummary {
    pub streams: usize,
    pub rows: u64,
    pub batches: usize,
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    reasoner: Arc<dyn Reasoner>,
    timeouts: TimeoutConfig,
    read_batch_rows: usize,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            store,
            reasoner,
            timeouts: TimeoutConfig::default(),
            read_batch_rows: DEFAULT_READ_BATCH_ROWS,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_read_batch_rows(mut self, rows: usize) -> Self {
        self.read_batch_rows = rows.max(1);
        self
    }

    /// Create the catalog entry for `(source, name)`, or update its units, URI and class.
    ///
    /// Streams with a URI also get an `rdf:type` statement in their source's graph.
    pub async fn register_stream(&self, ctx: &Context, stream: &Stream) -> Result<()> {
        stream.validate().map_err(|e| e.context("Cannot register invalid stream"))?;
        let ctx = ctx.with_timeout(self.timeouts.metadata);

        let created = ctx
            .run("register stream", run_as_transaction(self.store.as_ref(), RegisterStream { stream }))
            .await?;
        if created {
            info!(source = %stream.source_name, name = %stream.name, units = %stream.units, "Registered stream");
        } else {
            debug!(source = %stream.source_name, name = %stream.name, "Updated stream");
        }

        if stream.uri().is_some() {
            ctx.run("refresh reasoner", self.reasoner.refresh(self.store.as_ref())).await?;
        }
        Ok(())
    }

    /// Bulk-load every reading of `dataset` into its stream, all or nothing.
    pub async fn insert_historical_data(
        &self,
        ctx: &Context,
        dataset: &mut dyn Dataset,
    ) -> Result<IngestSummary> {
        dataset.check()?;
        let ctx = ctx.with_timeout(self.timeouts.write);

        let result = ctx
            .run(
                "insert historical data",
                run_as_transaction(self.store.as_ref(), InsertReadings { dataset: &mut *dataset }),
            )
            .await;

        match result {
            Ok(summary) => {
                info!(source = %dataset.source_name(), name = %dataset.name(), "Inserted {} readings", summary.copied);
                Ok(summary)
            }
            Err(err) => {
                // a producer failure explains a cancellation or a closed feed better
                let err = dataset.take_failure().unwrap_or(err);
                warn!(source = %dataset.source_name(), name = %dataset.name(), error = %err, "Insert failed");
                Err(err)
            }
        }
    }

    /// Bulk-load ontology statements; statements already present are skipped.
    pub async fn add_triples(
        &self,
        ctx: &Context,
        dataset: &mut dyn TripleDataset,
    ) -> Result<IngestSummary> {
        dataset.check()?;
        let ctx = ctx.with_timeout(self.timeouts.write);

        let result = ctx
            .run(
                "add triples",
                run_as_transaction(self.store.as_ref(), InsertTriples { dataset: &mut *dataset }),
            )
            .await;

        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                let err = dataset.take_failure().unwrap_or(err);
                warn!(source = %dataset.source(), origin = %dataset.origin(), error = %err, "Triple insert failed");
                return Err(err);
            }
        };
        info!(source = %dataset.source(), origin = %dataset.origin(), "Inserted {} triples", summary.merged);

        ctx.run("refresh reasoner", self.reasoner.refresh(self.store.as_ref())).await?;
        Ok(summary)
    }

    /// Resolve the query's target to stream ids.
    pub async fn resolve_query(&self, ctx: &Context, query: &Query) -> Result<Vec<i64>> {
        query.validate()?;
        let ctx = ctx.with_timeout(self.timeouts.read);
        let ids = ctx
            .run(
                "resolve query",
                resolution::resolve_ids(self.store.as_ref(), self.reasoner.as_ref(), query),
            )
            .await?;
        debug!(ids = ids.len(), "Resolved query");
        Ok(ids)
    }

    /// Write the metadata and data sections for already-resolved `ids`.
    pub async fn write_resolved<W>(
        &self,
        ctx: &Context,
        query: &Query,
        ids: &[i64],
        out: &mut W,
    ) -> Result<ReadSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let ctx = ctx.with_timeout(self.timeouts.read);
        ctx.run("read data chunk", async {
            let metadata = self
                .store
                .stream_metadata(ids)
                .await
                .map_err(|e| e.context("Error processing metadata"))?;
            encoding::write_metadata(&mut *out, &metadata)
                .await
                .map_err(|e| e.context("Error processing metadata"))?;

            let request = ScanRequest {
                ids: ids.to_vec(),
                start: query.start,
                end: query.end,
                aggregation: query.aggregation,
            };
            let mut rows = self.store.scan(&request).await.map_err(|e| e.context("Could not query"))?;
            let mut writer = DataBatchWriter::try_new(&mut *out, self.read_batch_rows).await?;
            while let Some(row) = rows.next().await {
                writer.push(&row?).await?;
            }
            let encoded = writer.finish().await?;
            Ok(ReadSummary { streams: metadata.len(), rows: encoded.rows, batches: encoded.batches })
        })
        .await
    }

    /// Resolve `query` and stream its result to `out` as Arrow IPC.
    pub async fn read_data_chunk<W>(&self, ctx: &Context, query: &Query, out: &mut W) -> Result<ReadSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let ctx = ctx.with_timeout(self.timeouts.read);
        let ids = self.resolve_query(&ctx, query).await?;
        let summary = self.write_resolved(&ctx, query, &ids, out).await?;
        info!(streams = summary.streams, rows = summary.rows, batches = summary.batches, "Read data chunk");
        Ok(summary)
    }

    /// Count the solutions of each query in every known graph.
    pub async fn qualify(&self, ctx: &Context, queries: &[String]) -> Result<QualifyResult> {
        let ctx = ctx.with_timeout(self.timeouts.read);
        ctx.run("qualify", qualify::qualify(self.store.as_ref(), self.reasoner.as_ref(), queries))
            .await
    }

    /// The reasoner's JSON answer, passed through untouched.
    pub async fn query_sparql_raw(&self, ctx: &Context, graph: &str, query: &str) -> Result<String> {
        let ctx = ctx.with_timeout(self.timeouts.read);
        ctx.run("sparql query", self.reasoner.query_raw(graph, query)).await
    }

    pub async fn statements(&self, ctx: &Context, source: Option<&str>) -> Result<Vec<TripleRecord>> {
        let ctx = ctx.with_timeout(self.timeouts.metadata);
        ctx.run("read statements", self.store.statements(source)).await
    }
}

struct RegisterStream<'a> {
    stream: &'a Stream,
}

#[async_trait]
impl<'a> UnitOfWork for RegisterStream<'a> {
    type Output = bool;

    async fn run(self, txn: &mut dyn StoreTransaction) -> Result<bool> {
        let created = txn.upsert_stream(self.stream).await?;
        if let Some(statement) = self.stream.type_statement(Utc::now()) {
            txn.assert_statement(&statement).await?;
        }
        Ok(created)
    }
}

struct InsertReadings<'a> {
    dataset: &'a mut dyn Dataset,
}

#[async_trait]
impl<'a> UnitOfWork for InsertReadings<'a> {
    type Output = IngestSummary;

    async fn run(self, txn: &mut dyn StoreTransaction) -> Result<IngestSummary> {
        let dataset = self.dataset;
        let id = txn.stream_id(dataset.source_name(), dataset.name()).await?.ok_or_else(|| {
            MortarError::NotFound(format!(
                "No such stream (SourceName: {}, Name: {})",
                dataset.source_name(),
                dataset.name()
            ))
        })?;
        dataset.set_id(id)?;

        let context = || format!("Cannot insert readings for id {}", id);
        let table = StagingTable::Readings;
        txn.create_staging_table(table).await.map_err(|e| e.context(context()))?;
        let copied = txn.copy_readings(&mut *dataset).await.map_err(|e| e.context(context()))?;
        let merged = txn.merge_staging_table(table).await.map_err(|e| e.context(context()))?;
        txn.drop_staging_table(table).await.map_err(|e| e.context(context()))?;
        Ok(IngestSummary { copied, merged })
    }
}

struct InsertTriples<'a> {
    dataset: &'a mut dyn TripleDataset,
}

#[async_trait]
impl<'a> UnitOfWork for InsertTriples<'a> {
    type Output = IngestSummary;

    async fn run(self, txn: &mut dyn StoreTransaction) -> Result<IngestSummary> {
        let dataset = self.dataset;
        let context = format!("Cannot insert triples for source {}", dataset.source());
        let table = StagingTable::Statements;
        txn.create_staging_table(table).await.map_err(|e| e.context(&context))?;
        let copied = txn.copy_statements(&mut *dataset).await.map_err(|e| e.context(&context))?;
        let merged = txn.merge_staging_table(table).await.map_err(|e| e.context(&context))?;
        txn.drop_staging_table(table).await.map_err(|e| e.context(&context))?;
        Ok(IngestSummary { copied, merged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Reading;
    use crate::dataset::{spawn_csv_parser, ArrayDataset, StreamingDataset};
    use crate::reasoner::EmbeddedReasoner;
    use crate::storage::MemoryStore;
    use chrono::{DateTime, Utc};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn engine() -> (Engine, MemoryStore) {
        let store = MemoryStore::new();
        let engine = Engine::new(Arc::new(store.clone()), Arc::new(EmbeddedReasoner::new()));
        (engine, store)
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_stream() {
        let (engine, store) = engine();
        let err = engine
            .register_stream(&Context::background(), &Stream::new("bldg1", "temp", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, MortarError::Validation(_)));
        assert!(err.to_string().contains("Cannot register invalid stream"));
        assert!(store.streams().await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_unknown_stream_is_not_found() {
        let (engine, store) = engine();
        let mut dataset = ArrayDataset::new(
            "bldg1",
            "ghost",
            vec![Reading::new(ts("2024-01-01T00:00:00Z"), 1.0)],
        );
        let err = engine
            .insert_historical_data(&Context::background(), &mut dataset)
            .await
            .unwrap_err();
        assert!(matches!(err, MortarError::NotFound(_)));
        assert!(err.to_string().contains("No such stream (SourceName: bldg1, Name: ghost)"));
        assert_eq!(store.reading_count().await, 0);
    }

    #[tokio::test]
    async fn test_bad_csv_row_aborts_insert() {
        let (engine, store) = engine();
        let ctx = Context::background();
        engine.register_stream(&ctx, &Stream::new("bldg1", "temp", "degF")).await.unwrap();

        let body = "2024-01-01T00:00:00Z,1.0\n2024-01-01T00:01:00Z,2.0\n2024-01-01T00:02:00Z,warm\n";
        let ingest = ctx.child();
        let (tx, mut dataset) = StreamingDataset::channel("bldg1", "temp");
        let parser = spawn_csv_parser(std::io::Cursor::new(body.as_bytes().to_vec()), tx, ingest.clone());

        let err = engine.insert_historical_data(&ingest, &mut dataset).await.unwrap_err();
        assert!(err.to_string().contains("Bad row 3 in CSV file"), "{}", err);
        assert_eq!(parser.await.unwrap(), 2);
        assert_eq!(store.reading_count().await, 0);
    }
}
