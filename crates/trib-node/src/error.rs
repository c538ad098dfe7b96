//! Node-level error types.

use thiserror::Error;
use trib_proto::ProtoError;
use trib_store::StoreError;

/// Failures that surface to the hosting process. Protocol-level
/// faults never appear here; they travel back to the offending peer
/// as `.error` ops. What remains is the unrecoverable kind: storage
/// durability failures and engine-internal defects.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtoError),

    #[error("record codec error: {0}")]
    Codec(String),

    #[error("session mailbox closed for {0}")]
    SessionClosed(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
