//! Storage-key composition and parsing.
//!
//! All key text handling lives here so the causal logic never touches
//! raw string surgery. The grammar:
//!
//! - op record:     `{typeid}!{tip-position}!.{name}`
//! - session meta:  `{typeid}.meta`
//! - node meta:     `.node`
//!
//! `'!'` sorts below `'.'`, which sorts below every alphabet digit.
//! The `!.` terminator after the position keeps op keys ordered by
//! arrival: when a later arrival extends the tip stack, the extended
//! key continues with `!` plus a digit, which sorts above the `!.` of
//! the shorter position. A plain `.` terminator would break this,
//! because `.` sorts above `!`. Meta keys still land after every op
//! record of their object.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use trib_proto::OpName;
use trib_time::TipStack;

/// Distinguished key holding the node's own persistent record.
pub const NODE_META: &str = ".node";

/// An ordered storage key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub String);

impl Key {
    /// Key of one stored op record at a given arrival position.
    pub fn op(typeid: &str, position: &str, name: &OpName) -> Key {
        Key(format!("{}!{}!.{}", typeid, position, name.as_str()))
    }

    /// Key of the per-object session record.
    pub fn meta(typeid: &str) -> Key {
        Key(format!("{}.meta", typeid))
    }

    /// Key of the node's own persistent record.
    pub fn node() -> Key {
        Key(NODE_META.to_string())
    }

    /// Lower bound (inclusive) for scanning one object's op records.
    pub fn scan_from(typeid: &str, position: &str) -> Key {
        Key(format!("{}!{}", typeid, position))
    }

    /// Upper bound (exclusive) covering all of one object's op
    /// records: `'.'` sorts above `'!'`, so the meta key works.
    pub fn scan_to(typeid: &str) -> Key {
        Key::meta(typeid)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split an op-record key back into its parts.
    pub fn parse_op(&self) -> Result<(String, TipStack, OpName)> {
        let (typeid, rest) = self
            .0
            .split_once('!')
            .ok_or_else(|| StoreError::MalformedKey(self.0.clone()))?;
        // `!.` never occurs inside a position: stack joins are always
        // followed by a time digit, and stamps never contain '.'
        let (position, name_text) = rest
            .split_once("!.")
            .ok_or_else(|| StoreError::MalformedKey(self.0.clone()))?;
        let position =
            TipStack::parse(position).ok_or_else(|| StoreError::MalformedKey(self.0.clone()))?;
        let name =
            OpName::parse(name_text).map_err(|_| StoreError::MalformedKey(self.0.clone()))?;
        if typeid.is_empty() || position.is_empty() {
            return Err(StoreError::MalformedKey(self.0.clone()));
        }
        Ok((typeid.to_string(), position, name))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
