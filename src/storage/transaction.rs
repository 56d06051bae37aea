//! Transaction coordinator shared by every write path.

use super::{Store, StoreTransaction};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use tracing::{debug, error};

/// A unit of work executed exactly once inside a transaction.
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    type Output: Send;

    async fn run(self, txn: &mut dyn StoreTransaction) -> Result<Self::Output>;
}

/// Begin a transaction, run `work`, then commit on success or roll back on failure.
///
/// A failed unit of work is returned as-is after a successful rollback. If the
/// rollback also fails, both causes are reported in a [`MortarError::Transaction`].
pub async fn run_as_transaction<W: UnitOfWork>(store: &dyn Store, work: W) -> Result<W::Output> {
    let mut txn = store.begin().await?;

    match work.run(txn.as_mut()).await {
        Ok(output) => {
            txn.commit().await.map_err(|e| {
                MortarError::transaction(format!("Error occurred during transaction commit: {}", e))
            })?;
            Ok(output)
        }
        Err(err) => match txn.rollback().await {
            Ok(()) => {
                debug!(error = %err, "Rolled back transaction");
                Err(err)
            }
            Err(rollback) => {
                error!(error = %err, rollback = %rollback, "Could not roll back transaction");
                Err(MortarError::Transaction {
                    message: err.to_string(),
                    rollback: Some(rollback.to_string()),
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Stream, StreamMetadata, TripleRecord};
    use crate::dataset::{Dataset, TripleDataset};
    use crate::storage::{DataRowStream, MemoryStore, ScanRequest, StagingTable};

    /// Memory store whose transactions cannot be rolled back.
    struct BrokenRollbackStore {
        inner: MemoryStore,
    }

    struct BrokenRollback {
        inner: Box<dyn StoreTransaction>,
    }

    #[async_trait]
    impl Store for BrokenRollbackStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
            Ok(Box::new(BrokenRollback { inner: self.inner.begin().await? }))
        }

        async fn resolve_ids(&self, labels: &[String], sources: &[String]) -> Result<Vec<i64>> {
            self.inner.resolve_ids(labels, sources).await
        }

        async fn stream_metadata(&self, ids: &[i64]) -> Result<Vec<StreamMetadata>> {
            self.inner.stream_metadata(ids).await
        }

        async fn scan(&self, request: &ScanRequest) -> Result<DataRowStream> {
            self.inner.scan(request).await
        }

        async fn graphs(&self) -> Result<Vec<String>> {
            self.inner.graphs().await
        }

        async fn statements(&self, source: Option<&str>) -> Result<Vec<TripleRecord>> {
            self.inner.statements(source).await
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl StoreTransaction for BrokenRollback {
        async fn upsert_stream(&mut self, stream: &Stream) -> Result<bool> {
            self.inner.upsert_stream(stream).await
        }

        async fn assert_statement(&mut self, record: &TripleRecord) -> Result<bool> {
            self.inner.assert_statement(record).await
        }

        async fn stream_id(&mut self, source: &str, name: &str) -> Result<Option<i64>> {
            self.inner.stream_id(source, name).await
        }

        async fn create_staging_table(&mut self, table: StagingTable) -> Result<()> {
            self.inner.create_staging_table(table).await
        }

        async fn copy_readings(&mut self, dataset: &mut dyn Dataset) -> Result<u64> {
            self.inner.copy_readings(dataset).await
        }

        async fn copy_statements(&mut self, dataset: &mut dyn TripleDataset) -> Result<u64> {
            self.inner.copy_statements(dataset).await
        }

        async fn merge_staging_table(&mut self, table: StagingTable) -> Result<u64> {
            self.inner.merge_staging_table(table).await
        }

        async fn drop_staging_table(&mut self, table: StagingTable) -> Result<()> {
            self.inner.drop_staging_table(table).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            drop(self.inner);
            Err(MortarError::Io("connection reset by peer".to_string()))
        }
    }

    struct RegisterThenFail<'a> {
        stream: &'a Stream,
    }

    #[async_trait]
    impl<'a> UnitOfWork for RegisterThenFail<'a> {
        type Output = ();

        async fn run(self, txn: &mut dyn StoreTransaction) -> Result<()> {
            txn.upsert_stream(self.stream).await?;
            Err(MortarError::Validation("forced failure".to_string()))
        }
    }

    struct Register<'a> {
        stream: &'a Stream,
    }

    #[async_trait]
    impl<'a> UnitOfWork for Register<'a> {
        type Output = bool;

        async fn run(self, txn: &mut dyn StoreTransaction) -> Result<bool> {
            txn.upsert_stream(self.stream).await
        }
    }

    #[tokio::test]
    async fn test_failed_work_is_rolled_back() {
        let store = MemoryStore::new();
        let stream = Stream::new("bldg1", "temp", "degF");

        let err = run_as_transaction(&store, RegisterThenFail { stream: &stream }).await.unwrap_err();
        assert!(matches!(err, MortarError::Validation(_)));
        assert!(store.streams().await.is_empty(), "nothing should be committed");
    }

    #[tokio::test]
    async fn test_successful_work_is_committed() {
        let store = MemoryStore::new();
        let stream = Stream::new("bldg1", "temp", "degF");

        assert!(run_as_transaction(&store, Register { stream: &stream }).await.unwrap());
        assert!(!run_as_transaction(&store, Register { stream: &stream }).await.unwrap());
        assert_eq!(store.streams().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_both_causes() {
        let store = BrokenRollbackStore { inner: MemoryStore::new() };
        let stream = Stream::new("bldg1", "temp", "degF");

        let err = run_as_transaction(&store, RegisterThenFail { stream: &stream }).await.unwrap_err();
        match &err {
            MortarError::Transaction { message, rollback: Some(rollback) } => {
                assert!(message.contains("forced failure"), "{}", message);
                assert!(rollback.contains("connection reset by peer"), "{}", rollback);
            }
            other => panic!("expected a transaction error with a rollback cause, got {:?}", other),
        }
        let text = err.to_string();
        assert!(text.contains("forced failure") && text.contains("Could not rollback"), "{}", text);
        assert!(store.inner.streams().await.is_empty(), "nothing should be committed");
    }
}
