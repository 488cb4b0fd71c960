//! Error types shared across the crate.

use std::path::PathBuf;

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to parse settings file {path:?}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("failed to read settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised by a tabular store backend.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("membership predicate on {column} has {values} values (limit {limit})")]
    PredicateTooLarge {
        column: String,
        values: usize,
        limit: usize,
    },

    #[error("migration failed: {0}")]
    Migration(String),

    /// Raised by the in-memory store when a failure was scheduled for a call.
    #[error("injected failure on {operation} call #{call}")]
    Injected { operation: &'static str, call: usize },
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed") {
            Self::Constraint(message)
        } else {
            Self::Query(message)
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
