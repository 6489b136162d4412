//! Error types for shardstore core operations.
//!
//! Open/close/migrate propagate these as typed errors. The data-path
//! operations (put/get/delete/query) deliberately swallow internal failures
//! into a `bool`/`Option` result and report them through the configured
//! diagnostics hook instead; see the `Storage` trait for the rationale.

use thiserror::Error;

/// Result type alias for shardstore operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Core error type for shardstore operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing storage could not be created, opened, or reached
    #[error("Init error: {0}")]
    Init(String),

    /// A statement against a shard failed to execute
    #[error("Execute error: {0}")]
    Execute(String),

    /// A query against a shard failed
    #[error("Query error: {0}")]
    Query(String),

    /// Schema creation or migration failure
    #[error("Schema error: {0}")]
    Schema(String),

    /// Encryption or decryption error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Generic error (fallback)
    #[error("{0}")]
    Unknown(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Init(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Execute(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unknown(err.to_string())
    }
}
