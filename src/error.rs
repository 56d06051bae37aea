//! Error types for Mortar operations

use std::fmt;
use thiserror::Error;

/// Result type alias for Mortar operations
pub type Result<T> = std::result::Result<T, MortarError>;

/// Main error type for Mortar operations
#[derive(Error, Debug, Clone)]
pub enum MortarError {
    /// Malformed or missing required field; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced stream or catalog entry is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store-level failure during a unit of work
    #[error("{}", transaction_message(.message, .rollback))]
    Transaction {
        /// Failure that caused the rollback, with operation context
        message: String,
        /// Rollback failure, if the rollback itself failed
        rollback: Option<String>,
    },

    /// Reasoner unreachable or returned malformed bindings
    #[error("Upstream query error: {0}")]
    UpstreamQuery(String),

    /// Result could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The operation's context was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The operation's deadline expired
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Violated internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

fn transaction_message(message: &str, rollback: &Option<String>) -> String {
    match rollback {
        Some(rollback) => format!(
            "Error ({}) occurred during transaction. Could not rollback: {}",
            message, rollback
        ),
        None => format!("Error occurred during transaction: {}", message),
    }
}

impl MortarError {
    /// Prefix the error message with what was being attempted, keeping the variant.
    pub fn context(self, what: impl fmt::Display) -> Self {
        match self {
            MortarError::Validation(msg) => MortarError::Validation(format!("{}: {}", what, msg)),
            MortarError::NotFound(msg) => MortarError::NotFound(format!("{}: {}", what, msg)),
            MortarError::Transaction { message, rollback } => {
                MortarError::Transaction { message: format!("{}: {}", what, message), rollback }
            }
            MortarError::UpstreamQuery(msg) => {
                MortarError::UpstreamQuery(format!("{}: {}", what, msg))
            }
            MortarError::Encoding(msg) => MortarError::Encoding(format!("{}: {}", what, msg)),
            MortarError::Cancelled(msg) => MortarError::Cancelled(format!("{}: {}", what, msg)),
            MortarError::DeadlineExceeded(msg) => {
                MortarError::DeadlineExceeded(format!("{}: {}", what, msg))
            }
            MortarError::Config(msg) => MortarError::Config(format!("{}: {}", what, msg)),
            MortarError::Io(msg) => MortarError::Io(format!("{}: {}", what, msg)),
            MortarError::Internal(msg) => MortarError::Internal(format!("{}: {}", what, msg)),
        }
    }

    /// Store failure without a rollback cause.
    pub fn transaction(message: impl Into<String>) -> Self {
        MortarError::Transaction { message: message.into(), rollback: None }
    }

    /// True for failures caused by the client's input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, MortarError::Validation(_) | MortarError::NotFound(_))
    }
}

impl From<tokio_postgres::Error> for MortarError {
    fn from(err: tokio_postgres::Error) -> Self {
        MortarError::transaction(err.to_string())
    }
}

impl<E: fmt::Display> From<bb8::RunError<E>> for MortarError {
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::User(e) => {
                MortarError::transaction(format!("Could not acquire connection from pool: {}", e))
            }
            bb8::RunError::TimedOut => MortarError::DeadlineExceeded(
                "timed out acquiring connection from pool".to_string(),
            ),
        }
    }
}

impl From<reqwest::Error> for MortarError {
    fn from(err: reqwest::Error) -> Self {
        MortarError::UpstreamQuery(err.to_string())
    }
}

impl From<serde_json::Error> for MortarError {
    fn from(err: serde_json::Error) -> Self {
        MortarError::Validation(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for MortarError {
    fn from(err: arrow::error::ArrowError) -> Self {
        MortarError::Encoding(err.to_string())
    }
}

impl From<regex::Error> for MortarError {
    fn from(err: regex::Error) -> Self {
        MortarError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for MortarError {
    fn from(err: std::io::Error) -> Self {
        MortarError::Io(err.to_string())
    }
}

impl From<oxigraph::model::IriParseError> for MortarError {
    fn from(err: oxigraph::model::IriParseError) -> Self {
        MortarError::Validation(err.to_string())
    }
}

impl From<oxigraph::io::RdfParseError> for MortarError {
    fn from(err: oxigraph::io::RdfParseError) -> Self {
        MortarError::Validation(err.to_string())
    }
}

impl From<oxigraph::io::RdfSyntaxError> for MortarError {
    fn from(err: oxigraph::io::RdfSyntaxError) -> Self {
        MortarError::Validation(err.to_string())
    }
}

impl From<oxigraph::sparql::QueryEvaluationError> for MortarError {
    fn from(err: oxigraph::sparql::QueryEvaluationError) -> Self {
        MortarError::UpstreamQuery(err.to_string())
    }
}

impl From<oxigraph::store::StorageError> for MortarError {
    fn from(err: oxigraph::store::StorageError) -> Self {
        MortarError::UpstreamQuery(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MortarError::Validation("Units is null".to_string());
        assert_eq!(err.to_string(), "Validation error: Units is null");
    }

    #[test]
    fn test_transaction_error_chains_rollback_cause() {
        let err = MortarError::Transaction {
            message: "copy failed".to_string(),
            rollback: Some("connection closed".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("copy failed"));
        assert!(text.contains("Could not rollback: connection closed"));
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = MortarError::NotFound("stream".to_string()).context("Cannot insert readings");
        assert!(matches!(err, MortarError::NotFound(_)));
        assert_eq!(err.to_string(), "Not found: Cannot insert readings: stream");
        assert!(err.is_client_error());
    }
}
