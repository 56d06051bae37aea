//! In-memory store with the same relational semantics as the TimescaleDB schema:
//! unique catalog keys, upsert and insert-if-absent merges, transaction-scoped
//! staging tables and time-bucketed aggregation.
//!
//! Transactions are serialized: an open transaction holds the store lock until it
//! commits or rolls back, and works on a private copy of the state.

use super::{DataRowStream, ScanRequest, StagingTable, Store, StoreTransaction};
use crate::core::{
    AggregationFunction, AggregationSpec, DataRow, ReadingRow, Stream, StreamMetadata,
    TripleRecord,
};
use crate::dataset::{Dataset, TripleDataset};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    streams: BTreeMap<i64, Stream>,
    /// (stream id, time) -> value
    data: BTreeMap<(i64, DateTime<Utc>), f64>,
    statements: BTreeSet<TripleRecord>,
}

impl State {
    fn find_stream(&self, source: &str, name: &str) -> Option<i64> {
        self.streams
            .iter()
            .find(|(_, s)| s.source_name == source && s.name == name)
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed catalog rows with their ids.
    pub async fn streams(&self) -> Vec<(i64, Stream)> {
        let state = self.state.lock().await;
        state.streams.iter().map(|(id, s)| (*id, s.clone())).collect()
    }

    /// Number of committed readings across all streams.
    pub async fn reading_count(&self) -> usize {
        self.state.lock().await.data.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            staged_readings: None,
            staged_statements: None,
        }))
    }

    async fn resolve_ids(&self, labels: &[String], sources: &[String]) -> Result<Vec<i64>> {
        let state = self.state.lock().await;
        let ids = state
            .streams
            .iter()
            .filter(|(_, s)| {
                labels.iter().any(|l| *l == s.name || Some(l.as_str()) == s.uri())
                    && (sources.is_empty() || sources.contains(&s.source_name))
            })
            .map(|(id, _)| *id)
            .collect();
        Ok(ids)
    }

    async fn stream_metadata(&self, ids: &[i64]) -> Result<Vec<StreamMetadata>> {
        let state = self.state.lock().await;
        let wanted: BTreeSet<i64> = ids.iter().copied().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|id| {
                state.streams.get(&id).map(|s| StreamMetadata {
                    brick_class: s.class().map(String::from),
                    brick_uri: s.uri().map(String::from),
                    units: Some(s.units.clone()),
                    name: Some(s.name.clone()),
                    stream_id: id,
                })
            })
            .collect())
    }

    async fn scan(&self, request: &ScanRequest) -> Result<DataRowStream> {
        let state = self.state.lock().await;
        let ids: BTreeSet<i64> = request.ids.iter().copied().collect();

        if request.end < request.start {
            return Ok(stream::empty().boxed());
        }
        let mut rows = Vec::new();
        for id in ids {
            let Some(stream) = state.streams.get(&id) else { continue };
            let label = stream.uri().unwrap_or(&stream.name).to_string();
            let readings = state
                .data
                .range((id, request.start)..=(id, request.end))
                .map(|((_, time), value)| (*time, *value));
            match &request.aggregation {
                None => rows.extend(readings.map(|(time, value)| DataRow {
                    time,
                    value,
                    label: label.clone(),
                })),
                Some(spec) => rows.extend(aggregate(readings, spec, &label)?),
            }
        }
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn graphs(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let graphs: BTreeSet<String> = state.statements.iter().map(|t| t.source.clone()).collect();
        Ok(graphs.into_iter().collect())
    }

    async fn statements(&self, source: Option<&str>) -> Result<Vec<TripleRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .statements
            .iter()
            .filter(|t| source.map_or(true, |s| t.source == s))
            .cloned()
            .collect())
    }

    async fn close(&self) {}
}

/// Reduce time-ordered readings into buckets aligned to the Unix epoch.
fn aggregate(
    readings: impl Iterator<Item = (DateTime<Utc>, f64)>,
    spec: &AggregationSpec,
    label: &str,
) -> Result<Vec<DataRow>> {
    let width = i64::try_from(spec.window.as_nanos())
        .map_err(|_| MortarError::Validation("Aggregation window is too large".to_string()))?;

    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for (time, value) in readings {
        let nanos = time
            .timestamp_nanos_opt()
            .ok_or_else(|| MortarError::Internal(format!("Timestamp {} out of range", time)))?;
        buckets.entry(nanos.div_euclid(width) * width).or_default().push(value);
    }

    Ok(buckets
        .into_iter()
        .map(|(start, values)| DataRow {
            time: DateTime::from_timestamp_nanos(start),
            value: reduce(spec.function, &values),
            label: label.to_string(),
        })
        .collect())
}

fn reduce(function: AggregationFunction, values: &[f64]) -> f64 {
    match function {
        AggregationFunction::Mean => values.iter().sum::<f64>() / values.len() as f64,
        AggregationFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationFunction::Sum => values.iter().sum(),
        AggregationFunction::Count => values.len() as f64,
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
    staged_readings: Option<Vec<ReadingRow>>,
    staged_statements: Option<Vec<TripleRecord>>,
}

impl MemoryTransaction {
    fn missing(table: StagingTable) -> MortarError {
        MortarError::transaction(format!("relation \"{}\" does not exist", table.table_name()))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn upsert_stream(&mut self, stream: &Stream) -> Result<bool> {
        let state = &mut self.working;
        match state.find_stream(&stream.source_name, &stream.name) {
            Some(id) => {
                if let Some(existing) = state.streams.get_mut(&id) {
                    existing.units = stream.units.clone();
                    existing.brick_uri = stream.uri().map(String::from);
                    existing.brick_class = stream.class().map(String::from);
                }
                Ok(false)
            }
            None => {
                state.next_id += 1;
                let mut row = stream.clone();
                row.brick_uri = stream.uri().map(String::from);
                row.brick_class = stream.class().map(String::from);
                state.streams.insert(state.next_id, row);
                Ok(true)
            }
        }
    }

    async fn assert_statement(&mut self, record: &TripleRecord) -> Result<bool> {
        let exists = self.working.statements.iter().any(|t| {
            t.source == record.source
                && t.subject == record.subject
                && t.predicate == record.predicate
                && t.object == record.object
        });
        if exists {
            return Ok(false);
        }
        Ok(self.working.statements.insert(record.clone()))
    }

    async fn stream_id(&mut self, source: &str, name: &str) -> Result<Option<i64>> {
        Ok(self.working.find_stream(source, name))
    }

    async fn create_staging_table(&mut self, table: StagingTable) -> Result<()> {
        let exists = match table {
            StagingTable::Readings => self.staged_readings.is_some(),
            StagingTable::Statements => self.staged_statements.is_some(),
        };
        if exists {
            return Err(MortarError::transaction(format!(
                "relation \"{}\" already exists",
                table.table_name()
            )));
        }
        match table {
            StagingTable::Readings => self.staged_readings = Some(Vec::new()),
            StagingTable::Statements => self.staged_statements = Some(Vec::new()),
        }
        Ok(())
    }

    async fn copy_readings(&mut self, dataset: &mut dyn Dataset) -> Result<u64> {
        let staged =
            self.staged_readings.as_mut().ok_or_else(|| Self::missing(StagingTable::Readings))?;
        let mut copied = 0;
        while dataset.advance().await? {
            staged.push(dataset.current()?);
            copied += 1;
        }
        Ok(copied)
    }

    async fn copy_statements(&mut self, dataset: &mut dyn TripleDataset) -> Result<u64> {
        let staged = self
            .staged_statements
            .as_mut()
            .ok_or_else(|| Self::missing(StagingTable::Statements))?;
        let mut copied = 0;
        while dataset.advance().await? {
            staged.push(dataset.current()?);
            copied += 1;
        }
        Ok(copied)
    }

    async fn merge_staging_table(&mut self, table: StagingTable) -> Result<u64> {
        match table {
            StagingTable::Readings => {
                let staged =
                    self.staged_readings.as_ref().ok_or_else(|| Self::missing(table))?;
                let mut merged = BTreeMap::new();
                for row in staged {
                    if !self.working.streams.contains_key(&row.stream_id) {
                        return Err(MortarError::transaction(format!(
                            "stream id {} violates foreign key on data",
                            row.stream_id
                        )));
                    }
                    merged.insert((row.stream_id, row.time), row.value);
                }
                let count = merged.len() as u64;
                self.working.data.extend(merged);
                Ok(count)
            }
            StagingTable::Statements => {
                let staged =
                    self.staged_statements.as_ref().ok_or_else(|| Self::missing(table))?;
                let mut inserted = 0;
                for record in staged {
                    if self.working.statements.insert(record.clone()) {
                        inserted += 1;
                    }
                }
                Ok(inserted)
            }
        }
    }

    async fn drop_staging_table(&mut self, table: StagingTable) -> Result<()> {
        let dropped = match table {
            StagingTable::Readings => self.staged_readings.take().is_some(),
            StagingTable::Statements => self.staged_statements.take().is_some(),
        };
        if dropped {
            Ok(())
        } else {
            Err(Self::missing(table))
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, working, .. } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parse_timestamp;
    use crate::dataset::ArrayDataset;
    use crate::core::Reading;
    use futures_util::TryStreamExt;
    use std::time::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    async fn seeded() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.upsert_stream(&Stream::new("bldg1", "temp", "degF")).await.unwrap();
        let id = txn.stream_id("bldg1", "temp").await.unwrap().unwrap();
        txn.commit().await.unwrap();
        (store, id)
    }

    async fn load(store: &MemoryStore, id: i64, readings: Vec<Reading>) -> u64 {
        let mut ds = ArrayDataset::new("bldg1", "temp", readings);
        ds.set_id(id).unwrap();
        let mut txn = store.begin().await.unwrap();
        txn.create_staging_table(StagingTable::Readings).await.unwrap();
        txn.copy_readings(&mut ds).await.unwrap();
        let merged = txn.merge_staging_table(StagingTable::Readings).await.unwrap();
        txn.drop_staging_table(StagingTable::Readings).await.unwrap();
        txn.commit().await.unwrap();
        merged
    }

    #[tokio::test]
    async fn test_upsert_keeps_single_row() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        assert!(txn.upsert_stream(&Stream::new("bldg1", "temp", "degF")).await.unwrap());
        assert!(!txn.upsert_stream(&Stream::new("bldg1", "temp", "degC")).await.unwrap());
        txn.commit().await.unwrap();

        let streams = store.streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].1.units, "degC");
    }

    #[tokio::test]
    async fn test_last_staged_value_wins() {
        let (store, id) = seeded().await;
        let t = ts("2020-01-01T00:00:00Z");
        let merged = load(&store, id, vec![Reading::new(t, 1.0), Reading::new(t, 5.0)]).await;
        assert_eq!(merged, 1);

        let request = ScanRequest { ids: vec![id], start: t, end: t, aggregation: None };
        let rows: Vec<DataRow> = store.scan(&request).await.unwrap().try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 5.0);
        assert_eq!(rows[0].label, "temp");
    }

    #[tokio::test]
    async fn test_staging_lifecycle_errors() {
        let (store, _) = seeded().await;
        let mut txn = store.begin().await.unwrap();
        let mut ds = ArrayDataset::new("bldg1", "temp", Vec::new());
        assert!(txn.copy_readings(&mut ds).await.is_err());
        txn.create_staging_table(StagingTable::Readings).await.unwrap();
        assert!(txn.create_staging_table(StagingTable::Readings).await.is_err());
        txn.drop_staging_table(StagingTable::Readings).await.unwrap();
        assert!(txn.drop_staging_table(StagingTable::Readings).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.upsert_stream(&Stream::new("bldg1", "temp", "degF")).await.unwrap();
        txn.rollback().await.unwrap();
        assert!(store.streams().await.is_empty());
    }

    #[tokio::test]
    async fn test_bucketed_aggregation() {
        let (store, id) = seeded().await;
        let readings = vec![
            Reading::new(ts("2020-01-01T00:00:00Z"), 1.0),
            Reading::new(ts("2020-01-01T00:30:00Z"), 3.0),
            Reading::new(ts("2020-01-01T01:10:00Z"), 10.0),
        ];
        load(&store, id, readings).await;

        let request = ScanRequest {
            ids: vec![id],
            start: ts("2020-01-01T00:00:00Z"),
            end: ts("2020-01-01T02:00:00Z"),
            aggregation: Some(
                AggregationSpec::new(AggregationFunction::Max, Duration::from_secs(3600)).unwrap(),
            ),
        };
        let rows: Vec<DataRow> = store.scan(&request).await.unwrap().try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].time, ts("2020-01-01T00:00:00Z"));
        assert_eq!(rows[0].value, 3.0);
        assert_eq!(rows[1].time, ts("2020-01-01T01:00:00Z"));
        assert_eq!(rows[1].value, 10.0);
    }

    #[tokio::test]
    async fn test_resolve_ids_by_name_uri_and_source() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.upsert_stream(&Stream::new("bldg1", "temp", "degF").with_brick_uri("http://ex.org/t1"))
            .await
            .unwrap();
        txn.upsert_stream(&Stream::new("bldg2", "temp", "degF")).await.unwrap();
        txn.commit().await.unwrap();

        let all = store.resolve_ids(&["temp".to_string()], &[]).await.unwrap();
        assert_eq!(all, vec![1, 2]);
        let by_uri = store.resolve_ids(&["http://ex.org/t1".to_string()], &[]).await.unwrap();
        assert_eq!(by_uri, vec![1]);
        let narrowed =
            store.resolve_ids(&["temp".to_string()], &["bldg2".to_string()]).await.unwrap();
        assert_eq!(narrowed, vec![2]);
    }
}
