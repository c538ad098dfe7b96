//! Immutable op records.
//!
//! An op is one timestamped mutation, subscription, unsubscription,
//! state snapshot, or error for one replicated object. Ops are never
//! mutated after construction; replies, relays, and errors are new
//! values derived from the original.

use crate::error::{ProtoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use trib_time::Stamp;

/// The closed set of op names.
///
/// `Mutation` carries the object-type-specific operation name (`set`,
/// `add`, `rm`, ...); the engine relays those without interpreting
/// them. The reserved names start with `.` or `~` so they can never
/// collide with a mutation name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OpName {
    /// Subscription request, and the reply to one.
    On,
    /// Unsubscription.
    Off,
    /// Full state snapshot push.
    State,
    /// Error reply.
    Error,
    /// A regular object mutation.
    Mutation(String),
}

impl OpName {
    pub fn as_str(&self) -> &str {
        match self {
            OpName::On => ".on",
            OpName::Off => ".off",
            OpName::State => "~state",
            OpName::Error => ".error",
            OpName::Mutation(name) => name,
        }
    }

    /// Parse a name. Reserved prefixes other than the known names are
    /// rejected; anything else is a mutation name.
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            ".on" => Ok(OpName::On),
            ".off" => Ok(OpName::Off),
            "~state" => Ok(OpName::State),
            ".error" => Ok(OpName::Error),
            _ if text.is_empty() || text.starts_with('.') || text.starts_with('~') => {
                Err(ProtoError::MalformedOp(format!("bad op name {:?}", text)))
            }
            _ => Ok(OpName::Mutation(text.to_string())),
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, OpName::Mutation(_))
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for OpName {
    fn from(text: String) -> Self {
        OpName::parse(&text).unwrap_or(OpName::Error)
    }
}

impl From<OpName> for String {
    fn from(name: OpName) -> Self {
        name.as_str().to_string()
    }
}

/// One immutable op, optionally bundling a catch-up patch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    /// The replicated object this op belongs to (its typeid).
    pub object: String,
    /// The op's own Lamport stamp.
    pub stamp: Stamp,
    pub name: OpName,
    /// Opaque value text; bookmark or ack vector for `.on`, message
    /// for `.error`, serialized state for `~state`.
    pub value: String,
    /// Catch-up ops delivered together with this one, in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<Op>>,
}

impl Op {
    pub fn new(
        object: impl Into<String>,
        stamp: Stamp,
        name: OpName,
        value: impl Into<String>,
    ) -> Self {
        Op {
            object: object.into(),
            stamp,
            name,
            value: value.into(),
            patch: None,
        }
    }

    /// The same op carrying a patch. A `None`-equivalent empty patch
    /// is normalized away.
    pub fn with_patch(mut self, patch: Vec<Op>) -> Self {
        self.patch = if patch.is_empty() { None } else { Some(patch) };
        self
    }

    /// The `.error` reply addressed back at this op: same object and
    /// stamp, so the sender can correlate it.
    pub fn error_reply(&self, message: impl Into<String>) -> Op {
        Op::new(
            self.object.clone(),
            self.stamp.clone(),
            OpName::Error,
            message,
        )
    }

    /// The bare op without its patch, for relaying.
    pub fn stripped(&self) -> Op {
        Op::new(
            self.object.clone(),
            self.stamp.clone(),
            self.name.clone(),
            self.value.clone(),
        )
    }

    pub fn is_on(&self) -> bool {
        self.name == OpName::On
    }

    pub fn is_error(&self) -> bool {
        self.name == OpName::Error
    }

    /// Cheap structural sanity check applied before routing: a real
    /// object id, a parseable stamp, a non-reserved shape.
    pub fn validate(&self) -> Result<()> {
        if self.object.is_empty() {
            return Err(ProtoError::MalformedOp("empty object id".into()));
        }
        if self.stamp.is_error() {
            return Err(ProtoError::MalformedStamp(self.stamp.to_string()));
        }
        if let Some(patch) = &self.patch {
            for op in patch {
                if op.object != self.object {
                    return Err(ProtoError::MalformedOp(format!(
                        "patch op for {} inside a bundle for {}",
                        op.object, self.object
                    )));
                }
                op.validate()?;
            }
        }
        Ok(())
    }

    /// Render the patchless one-line form `object!stamp.name value`.
    pub fn line(&self) -> String {
        format!("{}!{}.{} {}", self.object, self.stamp, self.name, self.value)
    }

    /// Parse the one-line form produced by [`Op::line`].
    pub fn parse_line(text: &str) -> Result<Op> {
        let (head, value) = match text.split_once(' ') {
            Some((h, v)) => (h, v),
            None => (text, ""),
        };
        let (object, rest) = head
            .split_once('!')
            .ok_or_else(|| ProtoError::MalformedOp(text.to_string()))?;
        // a stamp never contains '.', so the first '.' past the '!'
        // separates stamp from name (the name keeps its own prefix)
        let (stamp_text, name_text) = rest
            .split_once('.')
            .ok_or_else(|| ProtoError::MalformedOp(text.to_string()))?;
        let stamp = Stamp::parse(stamp_text);
        if stamp.is_error() {
            return Err(ProtoError::MalformedStamp(stamp_text.to_string()));
        }
        let name = OpName::parse(name_text)?;
        if object.is_empty() {
            return Err(ProtoError::MalformedOp(text.to_string()));
        }
        Ok(Op::new(object, stamp, name, value))
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line())?;
        if let Some(patch) = &self.patch {
            write!(f, " [+{}]", patch.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for (name, text) in [
            (OpName::On, ".on"),
            (OpName::Off, ".off"),
            (OpName::State, "~state"),
            (OpName::Error, ".error"),
            (OpName::Mutation("set".into()), "set"),
        ] {
            assert_eq!(name.as_str(), text);
            assert_eq!(OpName::parse(text).unwrap(), name);
        }
    }

    #[test]
    fn reserved_prefixes_are_rejected() {
        assert!(OpName::parse(".nope").is_err());
        assert!(OpName::parse("~other").is_err());
        assert!(OpName::parse("").is_err());
    }

    #[test]
    fn error_reply_points_back_at_the_op() {
        let op = Op::new("chat#1", Stamp::parse("5+a"), OpName::Mutation("set".into()), "x=1");
        let err = op.error_reply("causality violation");
        assert_eq!(err.object, op.object);
        assert_eq!(err.stamp, op.stamp);
        assert_eq!(err.name, OpName::Error);
        assert_eq!(err.value, "causality violation");
    }

    #[test]
    fn validate_rejects_mixed_bundles() {
        let op = Op::new("chat#1", Stamp::parse("5+a"), OpName::On, "0").with_patch(vec![Op::new(
            "other#2",
            Stamp::parse("4+a"),
            OpName::Mutation("set".into()),
            "",
        )]);
        assert!(op.validate().is_err());
    }

    #[test]
    fn validate_rejects_error_stamps() {
        let op = Op::new("chat#1", Stamp::error(), OpName::On, "0");
        assert!(op.validate().is_err());
    }

    #[test]
    fn empty_patch_is_normalized_away() {
        let op = Op::new("chat#1", Stamp::parse("5+a"), OpName::On, "0").with_patch(vec![]);
        assert_eq!(op.patch, None);
    }

    #[test]
    fn line_round_trip_for_mutations() {
        let op = Op::new("chat#1", Stamp::parse("5+a"), OpName::Mutation("set".into()), "x=1");
        let parsed = Op::parse_line(&op.line()).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn line_round_trip_for_reserved_names() {
        for name in [OpName::On, OpName::Off, OpName::State, OpName::Error] {
            let op = Op::new("chat#1", Stamp::parse("5+a"), name, "v");
            assert_eq!(Op::parse_line(&op.line()).unwrap(), op);
        }
    }

    #[test]
    fn serde_keeps_the_compact_forms() {
        let op = Op::new("chat#1", Stamp::parse("5+a"), OpName::On, "0");
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"5+a\""));
        assert!(json.contains("\".on\""));
        assert!(!json.contains("patch"));
        let back: Op = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
