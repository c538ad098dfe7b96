//! Storage error types.

use thiserror::Error;

/// Errors crossing the log-store boundary. A failed batch write is
/// the one class of failure the engine does not locally recover from:
/// the node refuses to acknowledge anything the batch would have
/// persisted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("batch write failed: {0}")]
    BatchFailed(String),

    #[error("malformed storage key: {0}")]
    MalformedKey(String),

    #[error("malformed stored record: {0}")]
    MalformedRecord(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
