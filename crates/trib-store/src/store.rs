//! The `LogStore` trait and the in-memory reference store.

use crate::error::{Result, StoreError};
use crate::key::Key;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// The ordered, range-scannable, batch-writable key-value store the
/// engine persists through. One replication node exclusively owns its
/// store handle; sessions reach it only for history loads, the node
/// for durable batch commits.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Read one record.
    async fn get(&self, key: &Key) -> Result<Option<String>>;

    /// Write a batch atomically: either every entry becomes durable
    /// or none does.
    async fn batch_put(&self, batch: Vec<(Key, String)>) -> Result<()>;

    /// Ordered scan over `[from, to)`; `reverse` flips the order of
    /// the returned entries, not the bounds.
    async fn scan_range(&self, from: &Key, to: &Key, reverse: bool) -> Result<Vec<(Key, String)>>;
}

/// Collapse same-key rewrites in a batch, keeping only the last write
/// per key while preserving the relative order of the survivors.
pub fn dedup_batch(batch: Vec<(Key, String)>) -> Vec<(Key, String)> {
    let mut out: Vec<(Key, String)> = Vec::with_capacity(batch.len());
    for (key, value) in batch {
        if let Some(slot) = out.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            out.push((key, value));
        }
    }
    out
}

/// In-memory reference store for tests and demos. The
/// `fail_next_batch` toggle lets tests exercise the durability
/// failure path.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: RwLock<BTreeMap<Key, String>>,
    fail_next_batch: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `batch_put` fail without persisting anything.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of every record, for assertions.
    pub fn dump(&self) -> Vec<(Key, String)> {
        self.records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn get(&self, key: &Key) -> Result<Option<String>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn batch_put(&self, batch: Vec<(Key, String)>) -> Result<()> {
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::BatchFailed("injected fault".into()));
        }
        let mut records = self.records.write();
        for (key, value) in batch {
            records.insert(key, value);
        }
        Ok(())
    }

    async fn scan_range(&self, from: &Key, to: &Key, reverse: bool) -> Result<Vec<(Key, String)>> {
        let records = self.records.read();
        let mut out: Vec<(Key, String)> = records
            .range(from.clone()..to.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if reverse {
            out.reverse();
        }
        Ok(out)
    }
}
