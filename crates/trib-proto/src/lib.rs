//! The op model of the tributary replication engine.
//!
//! Everything exchanged between replicas is an [`Op`]: one immutable
//! `(object, stamp, name, value)` record, optionally bundling a patch
//! of further ops. The closed [`OpName`] set keeps dispatch on a
//! typed tag; the session layer never matches on raw name text.

pub mod error;
pub mod op;

pub use error::{ProtoError, Result};
pub use op::{Op, OpName};
