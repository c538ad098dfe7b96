//! Object sessions and the replication node.
//!
//! This crate turns raw op traffic into correct subscribe, patch, and
//! relay behavior. One [`ObjectSession`] per replicated object
//! classifies every incoming op (new, replay, causality violation),
//! synthesizes catch-up patches for subscribers at arbitrary
//! bookmarks, and persists its state after every step. The
//! [`ReplicationNode`] owns the log store and the peer transport,
//! routes ops to sessions (one bounded mailbox each, one in-flight
//! step at a time), commits each step's save batch, and only then
//! flushes its sends.

pub mod error;
pub mod node;
pub mod session;
pub mod transport;

pub use error::{NodeError, Result};
pub use node::ReplicationNode;
pub use session::{ObjectSession, Reaction, SessionCtx};
pub use transport::{MemoryTransport, PeerId, Transport};
