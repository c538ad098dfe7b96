//! Protocol-level error taxonomy.

use thiserror::Error;

/// Errors raised while interpreting op traffic. Everything here is
/// recoverable: the node turns these into `.error` replies addressed
/// at the offending peer, never into a crash.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed stamp: {0}")]
    MalformedStamp(String),

    #[error("malformed op: {0}")]
    MalformedOp(String),

    #[error("malformed bookmark: {0}")]
    MalformedBookmark(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
