//! Flat per-origin version vectors.
//!
//! A [`VersionVector`] records, for each origin, the greatest time
//! component seen from it. It answers the "has this peer seen op X"
//! question for acknowledgement vectors attached to subscription
//! traffic, and serves as the exception set inside
//! [`crate::AnchoredVv`].

use crate::stamp::Stamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `origin -> max time` map with a compact text form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VersionVector {
    entries: BTreeMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-joined list of stamp strings; `"0"` or an empty
    /// string is the empty vector. Malformed entries are dropped; an
    /// ack vector is advisory, a bad entry only means "not seen".
    pub fn parse(text: &str) -> Self {
        let mut vv = VersionVector::new();
        if text.is_empty() || text == "0" {
            return vv;
        }
        for part in text.split(',') {
            let stamp = Stamp::parse(part.trim());
            if !stamp.is_error() && !stamp.is_zero() {
                vv.add(&stamp);
            }
        }
        vv
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Greatest time seen from `origin`, 0 if none.
    pub fn get(&self, origin: &str) -> u64 {
        self.entries.get(origin).copied().unwrap_or(0)
    }

    /// True when this vector has seen `stamp` (same origin, time at
    /// or past it). The zero stamp is always covered.
    pub fn covers(&self, stamp: &Stamp) -> bool {
        stamp.is_zero() || self.get(stamp.origin()) >= stamp.time()
    }

    /// Record a stamp; keeps the per-origin maximum.
    pub fn add(&mut self, stamp: &Stamp) {
        if stamp.is_zero() || stamp.is_error() {
            return;
        }
        let entry = self.entries.entry(stamp.origin().to_string()).or_insert(0);
        if stamp.time() > *entry {
            *entry = stamp.time();
        }
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &VersionVector) {
        for (origin, time) in &other.entries {
            let entry = self.entries.entry(origin.clone()).or_insert(0);
            if *time > *entry {
                *entry = *time;
            }
        }
    }

    /// Remove one origin's entry if `stamp` subsumes it.
    pub fn remove_covered_by(&mut self, stamp: &Stamp) {
        if let Some(time) = self.entries.get(stamp.origin()) {
            if *time <= stamp.time() {
                self.entries.remove(stamp.origin());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(o, t)| (o.as_str(), *t))
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "0");
        }
        let mut first = true;
        for (origin, time) in &self.entries {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", Stamp::new(*time, origin.clone()))?;
            first = false;
        }
        Ok(())
    }
}

impl From<String> for VersionVector {
    fn from(text: String) -> Self {
        VersionVector::parse(&text)
    }
}

impl From<VersionVector> for String {
    fn from(vv: VersionVector) -> Self {
        vv.to_string()
    }
}
