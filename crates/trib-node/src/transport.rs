//! The peer transport boundary.
//!
//! The engine never blocks on the network: sends are fire-and-forget,
//! with protocol-level acknowledgement (subscription replies, op
//! relays) as the only delivery signal. The concrete byte transport
//! and handshake negotiation live outside this crate; what crosses
//! this trait is already an [`Op`] addressed at a known peer.

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use trib_proto::Op;

/// Opaque peer identifier, granted during connection handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound op dispatch toward one peer connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &PeerId, op: Op) -> Result<()>;
}

/// In-memory transport capturing per-peer queues, for tests and
/// demos.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<PeerId, Vec<Op>>>,
    fail_next_send: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `send` fail, for dropped-connection tests.
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    /// Drain everything queued for one peer.
    pub fn take(&self, peer: &PeerId) -> Vec<Op> {
        self.queues.lock().remove(peer).unwrap_or_default()
    }

    /// Ops queued for one peer without draining.
    pub fn peek(&self, peer: &PeerId) -> Vec<Op> {
        self.queues.lock().get(peer).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(|q| q.is_empty())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &PeerId, op: Op) -> Result<()> {
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(NodeError::Transport("injected fault".into()));
        }
        self.queues.lock().entry(to.clone()).or_default().push(op);
        Ok(())
    }
}
