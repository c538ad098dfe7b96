//! The log-store boundary of the tributary replication engine.
//!
//! The engine assumes nothing about physical storage beyond an
//! ordered, range-scannable, batch-writable key-value store reached
//! through the narrow [`LogStore`] trait. The key grammar lives in
//! [`key`], isolated from the causal logic; [`MemoryLogStore`] is the
//! reference implementation used by tests and demos.

pub mod error;
pub mod key;
pub mod store;

pub use error::{Result, StoreError};
pub use key::Key;
pub use store::{dedup_batch, LogStore, MemoryLogStore};
