//! Unified error type for the sink
//!
//! Store failures are surfaced to the caller of the ledger operation that
//! triggered them. Nothing here is retried internally.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Ledger lock poisoned: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SinkError {
    fn from(err: toml::de::Error) -> Self {
        SinkError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Decode(err.to_string())
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        SinkError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for SinkError {
    fn from(err: r2d2::Error) -> Self {
        SinkError::Database(err.to_string())
    }
}

/// Result type alias using SinkError
pub type Result<T> = std::result::Result<T, SinkError>;
