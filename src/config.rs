//! Configuration structures and utilities

use crate::error::{MortarError, Result};
use std::time::Duration;

/// Maximum time a data query may take before it is cancelled
pub const DATA_READ_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Maximum time a data insertion may take before it is cancelled
pub const DATA_WRITE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Maximum time for stream registration and metadata operations
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows buffered into one data record batch before it is flushed
pub const DEFAULT_READ_BATCH_ROWS: usize = 2_000_000;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub reasoner: ReasonerConfig,
    pub timeouts: TimeoutConfig,
    pub read_batch_rows: usize,
}

/// HTTP listener configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub listen_address: String,
    pub port: String,
}

/// Connection information for the PostgreSQL/TimescaleDB store
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub port: String,
    pub max_connections: u32,
    pub max_idle_time: Duration,
    pub max_lifetime: Duration,
}

/// Location of the semantic-query reasoner
#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    /// host:port of the reasoner's HTTP interface
    pub address: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub read: Duration,
    pub write: Duration,
    pub metadata: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { read: DATA_READ_TIMEOUT, write: DATA_WRITE_TIMEOUT, metadata: METADATA_TIMEOUT }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            database: "mortar".to_string(),
            user: "mortarchangeme".to_string(),
            password: "mortarpasswordchangeme".to_string(),
            port: "5434".to_string(),
            max_connections: 50,
            max_idle_time: Duration::from_secs(15 * 60),
            max_lifetime: Duration::from_secs(15 * 60),
        }
    }
}

impl Config {
    /// The insecure local development settings: helpful for debugging, but never run in production!
    pub fn insecure_defaults() -> Self {
        Self {
            http: HttpConfig { listen_address: "localhost".to_string(), port: "5001".to_string() },
            database: DatabaseConfig::default(),
            reasoner: ReasonerConfig {
                address: "localhost:3030".to_string(),
                request_timeout: DATA_READ_TIMEOUT,
            },
            timeouts: TimeoutConfig::default(),
            read_batch_rows: DEFAULT_READ_BATCH_ROWS,
        }
    }

    /// Rejects configurations that cannot possibly connect to the database.
    pub fn check(&self) -> Result<()> {
        let db = &self.database;
        let missing = if db.host.is_empty() {
            Some("Database.Host is empty")
        } else if db.database.is_empty() {
            Some("Database.Database is empty")
        } else if db.user.is_empty() {
            Some("Database.User is empty")
        } else if db.password.is_empty() {
            Some("Database.Password is empty")
        } else if db.port.is_empty() {
            Some("Database.Port is empty")
        } else if self.read_batch_rows == 0 {
            Some("read batch size must be positive")
        } else {
            None
        };
        match missing {
            Some(msg) => Err(MortarError::Config(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.http.listen_address, self.http.port)
    }
}

impl DatabaseConfig {
    /// libpq-style connection string understood by tokio-postgres
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_defaults_are_valid() {
        let cfg = Config::insecure_defaults();
        assert!(cfg.check().is_ok());
        assert_eq!(cfg.http_address(), "localhost:5001");
    }

    #[test]
    fn test_check_rejects_missing_password() {
        let mut cfg = Config::insecure_defaults();
        cfg.database.password.clear();
        let err = cfg.check().unwrap_err();
        assert!(err.to_string().contains("Database.Password is empty"));
    }

    #[test]
    fn test_connection_string() {
        let db = DatabaseConfig::default();
        assert_eq!(
            db.connection_string(),
            "host=localhost port=5434 dbname=mortar user=mortarchangeme password=mortarpasswordchangeme"
        );
    }
}
