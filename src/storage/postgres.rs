//! PostgreSQL/TimescaleDB store over a bb8 connection pool.

use super::{DataRowStream, ScanRequest, StagingTable, Store, StoreTransaction};
use crate::config::DatabaseConfig;
use crate::core::{DataRow, Stream, StreamMetadata, TripleRecord};
use crate::dataset::{Dataset, TripleDataset};
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use futures_util::{pin_mut, ready, StreamExt};
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls, Row, RowStream};
use tracing::{debug, info, warn};

type Connection = PooledConnection<'static, Manager>;

/// Delay between attempts while waiting for the database at startup
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL,
    source      TEXT NOT NULL,
    units       TEXT NOT NULL,
    brick_uri   TEXT,
    brick_class TEXT,
    UNIQUE (source, name)
);
CREATE TABLE IF NOT EXISTS data (
    time      TIMESTAMPTZ NOT NULL,
    stream_id BIGINT NOT NULL REFERENCES streams (id),
    value     DOUBLE PRECISION NOT NULL,
    UNIQUE (time, stream_id)
);
CREATE TABLE IF NOT EXISTS triples (
    source TEXT NOT NULL,
    origin TEXT NOT NULL,
    time   TIMESTAMPTZ NOT NULL,
    s      TEXT NOT NULL,
    p      TEXT NOT NULL,
    o      TEXT NOT NULL,
    UNIQUE (source, origin, time, s, p, o)
);
CREATE OR REPLACE VIEW unified AS
    SELECT data.time, data.value, data.stream_id,
           streams.name, streams.source, streams.units, streams.brick_uri, streams.brick_class
    FROM data JOIN streams ON data.stream_id = streams.id;
DO $$
BEGIN
    IF EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb') THEN
        PERFORM create_hypertable('data', 'time', if_not_exists => TRUE);
    END IF;
END
$$;
"#;

/// A pooled client. Poisoned clients are discarded by the pool instead of reused.
struct PgConnection {
    client: Client,
    poisoned: bool,
}

impl PgConnection {
    fn is_usable(&self) -> bool {
        !self.poisoned && !self.client.is_closed()
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

/// bb8 manager handing out [`PgConnection`]s.
struct Manager {
    inner: PostgresConnectionManager<NoTls>,
}

#[async_trait]
impl ManageConnection for Manager {
    type Connection = PgConnection;
    type Error = tokio_postgres::Error;

    async fn connect(&self) -> std::result::Result<PgConnection, tokio_postgres::Error> {
        let client = self.inner.connect().await?;
        Ok(PgConnection { client, poisoned: false })
    }

    async fn is_valid(&self, conn: &mut PgConnection) -> std::result::Result<(), tokio_postgres::Error> {
        self.inner.is_valid(&mut conn.client).await
    }

    fn has_broken(&self, conn: &mut PgConnection) -> bool {
        !conn.is_usable()
    }
}

/// Release a connection whose owner went away mid-statement.
///
/// The running statement is cancelled on the server and `cleanup` (if any) is run
/// before the connection goes back to the pool. Without a runtime to do that on,
/// or when either step fails, the connection is poisoned so the pool drops it and
/// the server aborts the session's transaction.
fn abandon(mut conn: Connection, cancel: CancelToken, cleanup: Option<&'static str>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        conn.poisoned = true;
        return;
    };
    handle.spawn(async move {
        if let Err(e) = cancel.cancel_query(NoTls).await {
            warn!(error = %e, "Could not cancel abandoned statement");
            conn.poisoned = true;
            return;
        }
        if let Some(statement) = cleanup {
            if let Err(e) = conn.batch_execute(statement).await {
                warn!(error = %e, statement, "Could not clean up abandoned connection");
                conn.poisoned = true;
            }
        }
    });
}

pub struct PostgresStore {
    pool: Pool<Manager>,
}

impl PostgresStore {
    /// Build the pool, waiting (forever) until the database answers.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = config
            .connection_string()
            .parse()
            .map_err(|e| MortarError::Config(format!("Invalid config to connect to database: {}", e)))?;
        let manager = Manager { inner: PostgresConnectionManager::new(pg_config, NoTls) };

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .idle_timeout(Some(config.max_idle_time))
            .max_lifetime(Some(config.max_lifetime))
            .build_unchecked(manager);

        loop {
            match Self::ping(&pool).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        error = %e,
                        "Failed to connect to database; retrying in {} seconds",
                        CONNECT_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        info!(host = %config.host, "Connected to postgres");
        Ok(Self { pool })
    }

    async fn ping(pool: &Pool<Manager>) -> Result<()> {
        let conn = pool.get().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Create the relations, the `unified` view and (with TimescaleDB) the hypertable.
    pub async fn migrate(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await.map_err(|e| MortarError::from(e).context("Could not migrate schema"))?;
        debug!("Schema is up to date");
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<PostgresTransaction> {
        let conn = self.pool.get_owned().await?;
        conn.batch_execute("BEGIN")
            .await
            .map_err(|e| MortarError::transaction(format!("Could not begin transaction: {}", e)))?;
        let cancel = conn.cancel_token();
        Ok(PostgresTransaction { conn: Some(conn), cancel })
    }
}

fn label_filter(with_sources: bool) -> &'static str {
    if with_sources {
        "SELECT id FROM streams WHERE (name = ANY($1) OR brick_uri = ANY($1)) AND source = ANY($2) ORDER BY id"
    } else {
        "SELECT id FROM streams WHERE (name = ANY($1) OR brick_uri = ANY($1)) ORDER BY id"
    }
}

/// SQL for a scan; `$1` start, `$2` end, `$3` ids.
fn scan_sql(request: &ScanRequest) -> Result<String> {
    match &request.aggregation {
        None => Ok("SELECT time, value, COALESCE(brick_uri, name) AS label
                    FROM unified
                    WHERE time >= $1 AND time <= $2 AND stream_id = ANY($3)
                    ORDER BY stream_id, time"
            .to_string()),
        Some(spec) => {
            let micros = spec.window.as_micros();
            if micros == 0 {
                return Err(MortarError::Validation(
                    "Aggregation window must be at least one microsecond".to_string(),
                ));
            }
            Ok(format!(
                "SELECT time_bucket('{} microseconds'::interval, time) AS bucket,
                        {}(value)::double precision AS value,
                        COALESCE(brick_uri, name) AS label
                 FROM unified
                 WHERE time >= $1 AND time <= $2 AND stream_id = ANY($3)
                 GROUP BY bucket, stream_id, label
                 ORDER BY stream_id, bucket",
                micros,
                spec.function.sql_name()
            ))
        }
    }
}

fn data_row(row: &Row) -> Result<DataRow> {
    Ok(DataRow { time: row.try_get(0)?, value: row.try_get(1)?, label: row.try_get(2)? })
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(self.begin_transaction().await?))
    }

    async fn resolve_ids(&self, labels: &[String], sources: &[String]) -> Result<Vec<i64>> {
        let conn = self.pool.get().await?;
        let rows = if sources.is_empty() {
            conn.query(label_filter(false), &[&labels]).await?
        } else {
            conn.query(label_filter(true), &[&labels, &sources]).await?
        };
        rows.iter().map(|r| r.try_get::<_, i64>(0).map_err(MortarError::from)).collect()
    }

    async fn stream_metadata(&self, ids: &[i64]) -> Result<Vec<StreamMetadata>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, brick_class, brick_uri, units, name FROM streams
                 WHERE id = ANY($1) ORDER BY id",
                &[&ids],
            )
            .await?;
        rows.iter()
            .map(|r| {
                Ok(StreamMetadata {
                    stream_id: r.try_get(0)?,
                    brick_class: r.try_get(1)?,
                    brick_uri: r.try_get(2)?,
                    units: r.try_get(3)?,
                    name: r.try_get(4)?,
                })
            })
            .collect()
    }

    async fn scan(&self, request: &ScanRequest) -> Result<DataRowStream> {
        let sql = scan_sql(request)?;
        let conn = self.pool.get_owned().await?;
        let params: [&(dyn ToSql + Sync); 3] = [&request.start, &request.end, &request.ids];
        let rows = conn.query_raw(sql.as_str(), params).await?;
        let cancel = conn.cancel_token();
        Ok(ScanRows { rows: Box::pin(rows), conn: Some(conn), cancel }.boxed())
    }

    async fn graphs(&self) -> Result<Vec<String>> {
        let conn = self.pool.get().await?;
        let rows = conn.query("SELECT DISTINCT source FROM triples ORDER BY source", &[]).await?;
        rows.iter().map(|r| r.try_get::<_, String>(0).map_err(MortarError::from)).collect()
    }

    async fn statements(&self, source: Option<&str>) -> Result<Vec<TripleRecord>> {
        let conn = self.pool.get().await?;
        let rows = match source {
            Some(source) => {
                conn.query(
                    "SELECT source, origin, time, s, p, o FROM triples WHERE source = $1
                     ORDER BY source, origin, time, s, p, o",
                    &[&source],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT source, origin, time, s, p, o FROM triples
                     ORDER BY source, origin, time, s, p, o",
                    &[],
                )
                .await?
            }
        };
        rows.iter()
            .map(|r| {
                Ok(TripleRecord {
                    source: r.try_get(0)?,
                    origin: r.try_get(1)?,
                    time: r.try_get(2)?,
                    subject: r.try_get(3)?,
                    predicate: r.try_get(4)?,
                    object: r.try_get(5)?,
                })
            })
            .collect()
    }

    async fn close(&self) {
        // bb8 closes idle connections once the pool is dropped
        let state = self.pool.state();
        info!(connections = state.connections, "Closing database pool");
    }
}

/// Rows of one scan. The connection stays checked out until the rows are drained;
/// dropped early, the query is cancelled on the server.
struct ScanRows {
    rows: Pin<Box<RowStream>>,
    conn: Option<Connection>,
    cancel: CancelToken,
}

impl futures_util::Stream for ScanRows {
    type Item = Result<DataRow>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.rows.poll_next_unpin(cx)) {
            Some(row) => Poll::Ready(Some(row.map_err(MortarError::from).and_then(|row| data_row(&row)))),
            None => {
                self.conn = None;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for ScanRows {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            abandon(conn, self.cancel.clone(), None);
        }
    }
}

/// Explicit BEGIN/COMMIT/ROLLBACK on an owned pooled connection.
pub struct PostgresTransaction {
    conn: Option<Connection>,
    cancel: CancelToken,
}

impl PostgresTransaction {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| MortarError::Internal("transaction already finished".to_string()))
    }

    /// Run `statement` and release the connection. If this fails or is dropped
    /// part way, the connection is still held and `Drop` cleans up.
    async fn finish(mut self: Box<Self>, statement: &str) -> Result<()> {
        self.conn()?.batch_execute(statement).await?;
        self.conn = None;
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            abandon(conn, self.cancel.clone(), Some("ROLLBACK"));
        }
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn upsert_stream(&mut self, stream: &Stream) -> Result<bool> {
        let row = self
            .conn()?
            .query_one(
                "INSERT INTO streams (name, source, units, brick_uri, brick_class)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (source, name) DO UPDATE
                 SET brick_uri = EXCLUDED.brick_uri,
                     brick_class = EXCLUDED.brick_class,
                     units = EXCLUDED.units
                 RETURNING (xmax = 0) AS inserted",
                &[&stream.name, &stream.source_name, &stream.units, &stream.uri(), &stream.class()],
            )
            .await
            .map_err(|e| MortarError::transaction(format!("Could not register stream: {}", e)))?;
        Ok(row.try_get(0)?)
    }

    async fn assert_statement(&mut self, record: &TripleRecord) -> Result<bool> {
        let inserted = self
            .conn()?
            .execute(
                "INSERT INTO triples (source, origin, time, s, p, o)
                 SELECT $1, $2, $3, $4, $5, $6
                 WHERE NOT EXISTS (
                     SELECT 1 FROM triples WHERE source = $1 AND s = $4 AND p = $5 AND o = $6
                 )
                 ON CONFLICT DO NOTHING",
                &[
                    &record.source,
                    &record.origin,
                    &record.time,
                    &record.subject,
                    &record.predicate,
                    &record.object,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn stream_id(&mut self, source: &str, name: &str) -> Result<Option<i64>> {
        let row = self
            .conn()?
            .query_opt("SELECT id FROM streams WHERE source = $1 AND name = $2", &[&source, &name])
            .await?;
        row.map(|r| r.try_get::<_, i64>(0)).transpose().map_err(MortarError::from)
    }

    async fn create_staging_table(&mut self, table: StagingTable) -> Result<()> {
        let ddl = match table {
            StagingTable::Readings => {
                "CREATE TEMP TABLE datat (seq BIGSERIAL, time TIMESTAMPTZ, stream_id BIGINT, value DOUBLE PRECISION)"
            }
            StagingTable::Statements => {
                "CREATE TEMP TABLE triplet (source TEXT, origin TEXT, time TIMESTAMPTZ, s TEXT, p TEXT, o TEXT)"
            }
        };
        self.conn()?.batch_execute(ddl).await?;
        Ok(())
    }

    async fn copy_readings(&mut self, dataset: &mut dyn Dataset) -> Result<u64> {
        let sink = self.conn()?.copy_in("COPY datat (time, stream_id, value) FROM STDIN BINARY").await?;
        let writer = BinaryCopyInWriter::new(sink, &[Type::TIMESTAMPTZ, Type::INT8, Type::FLOAT8]);
        pin_mut!(writer);
        while dataset.advance().await? {
            let row = dataset.current()?;
            writer.as_mut().write(&[&row.time, &row.stream_id, &row.value]).await?;
        }
        Ok(writer.finish().await?)
    }

    async fn copy_statements(&mut self, dataset: &mut dyn TripleDataset) -> Result<u64> {
        let sink = self
            .conn()?
            .copy_in("COPY triplet (source, origin, time, s, p, o) FROM STDIN BINARY")
            .await?;
        let writer = BinaryCopyInWriter::new(
            sink,
            &[Type::TEXT, Type::TEXT, Type::TIMESTAMPTZ, Type::TEXT, Type::TEXT, Type::TEXT],
        );
        pin_mut!(writer);
        while dataset.advance().await? {
            let t = dataset.current()?;
            let time: DateTime<Utc> = t.time;
            writer
                .as_mut()
                .write(&[&t.source, &t.origin, &time, &t.subject, &t.predicate, &t.object])
                .await?;
        }
        Ok(writer.finish().await?)
    }

    async fn merge_staging_table(&mut self, table: StagingTable) -> Result<u64> {
        let sql = match table {
            // collapse duplicate keys within one load to the last copied row
            StagingTable::Readings => {
                "INSERT INTO data (time, stream_id, value)
                 SELECT DISTINCT ON (time, stream_id) time, stream_id, value FROM datat
                 ORDER BY time, stream_id, seq DESC
                 ON CONFLICT (time, stream_id) DO UPDATE SET value = EXCLUDED.value"
            }
            StagingTable::Statements => {
                "INSERT INTO triples (source, origin, time, s, p, o)
                 SELECT source, origin, time, s, p, o FROM triplet
                 ON CONFLICT (source, origin, time, s, p, o) DO NOTHING"
            }
        };
        Ok(self.conn()?.execute(sql, &[]).await?)
    }

    async fn drop_staging_table(&mut self, table: StagingTable) -> Result<()> {
        self.conn()?.batch_execute(&format!("DROP TABLE {}", table.table_name())).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AggregationFunction, AggregationSpec};

    fn request(aggregation: Option<AggregationSpec>) -> ScanRequest {
        ScanRequest { ids: vec![1], start: Utc::now(), end: Utc::now(), aggregation }
    }

    #[test]
    fn test_scan_sql_plain() {
        let sql = scan_sql(&request(None)).unwrap();
        assert!(sql.contains("ORDER BY stream_id, time"));
        assert!(!sql.contains("time_bucket"));
    }

    #[test]
    fn test_scan_sql_aggregated() {
        let spec = AggregationSpec::new(AggregationFunction::Mean, Duration::from_secs(3600)).unwrap();
        let sql = scan_sql(&request(Some(spec))).unwrap();
        assert!(sql.contains("time_bucket('3600000000 microseconds'::interval, time)"));
        assert!(sql.contains("avg(value)"));
        assert!(sql.contains("GROUP BY bucket, stream_id, label"));
    }

    #[test]
    fn test_scan_sql_rejects_sub_microsecond_window() {
        let spec = AggregationSpec::new(AggregationFunction::Sum, Duration::from_nanos(10)).unwrap();
        assert!(scan_sql(&request(Some(spec))).is_err());
    }

    #[test]
    fn test_staging_table_names() {
        assert_eq!(StagingTable::Readings.table_name(), "datat");
        assert_eq!(StagingTable::Statements.table_name(), "triplet");
    }

    /// Store on the database named by `MORTAR_TEST_DB_HOST` (and optionally
    /// `MORTAR_TEST_DB_PORT`); `None` skips the test.
    async fn live_store() -> Option<PostgresStore> {
        let host = std::env::var("MORTAR_TEST_DB_HOST").ok()?;
        let mut config = DatabaseConfig { host, ..DatabaseConfig::default() };
        if let Ok(port) = std::env::var("MORTAR_TEST_DB_PORT") {
            config.port = port;
        }
        Some(PostgresStore::connect(&config).await.unwrap())
    }

    async fn backend_state(monitor: &Connection, pid: i32) -> Option<String> {
        monitor
            .query_opt("SELECT state FROM pg_stat_activity WHERE pid = $1", &[&pid])
            .await
            .unwrap()
            .and_then(|row| row.get::<_, Option<String>>(0))
    }

    #[tokio::test]
    async fn test_dropped_transaction_cancels_running_statement() {
        let Some(store) = live_store().await else { return };
        let monitor = store.pool.get_owned().await.unwrap();

        let txn = store.begin_transaction().await.unwrap();
        let pid: i32 = txn.conn().unwrap().query_one("SELECT pg_backend_pid()", &[]).await.unwrap().get(0);
        let sleep = txn.conn().unwrap().batch_execute("SELECT pg_sleep(60)");
        assert!(tokio::time::timeout(Duration::from_millis(300), sleep).await.is_err());
        drop(txn);

        // without a cancel the backend stays active for a minute
        let mut state = backend_state(&monitor, pid).await;
        for _ in 0..50 {
            if matches!(state.as_deref(), None | Some("idle")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            state = backend_state(&monitor, pid).await;
        }
        assert!(matches!(state.as_deref(), None | Some("idle")), "backend still {:?}", state);
    }

    #[tokio::test]
    async fn test_poisoned_connection_leaves_the_pool() {
        let Some(store) = live_store().await else { return };
        let mut conn = store.pool.get_owned().await.unwrap();
        assert!(conn.is_usable());

        let before = store.pool.state().connections;
        conn.poisoned = true;
        assert!(!conn.is_usable());
        drop(conn);
        assert_eq!(store.pool.state().connections, before - 1);
    }
}
