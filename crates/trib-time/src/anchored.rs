//! Anchored version vectors.
//!
//! A full causal history is too large to carry on every handshake.
//! An [`AnchoredVv`] is the smallest structure that still answers
//! "has the peer seen op X" exactly: a single **anchor** arrival
//! position ("everything that arrived at or before this position is
//! known") plus a small set of per-origin **exceptions** beyond it,
//! for ops acknowledged out of the arrival order or along another
//! path.
//!
//! The anchor is a position, not a stamp. An op that arrives late
//! sits at a stacked position past the point its stamp alone would
//! suggest, and an anchor that pointed at a bare stamp would swallow
//! it unseen. Comparing flattened position text keeps the check
//! exact, since positions grow lexicographically with every arrival.

use crate::stamp::Stamp;
use crate::tip::TipStack;
use crate::vv::VersionVector;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One anchor position plus exceptions beyond it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AnchoredVv {
    anchor: String,
    exceptions: VersionVector,
}

impl Default for AnchoredVv {
    fn default() -> Self {
        AnchoredVv::new()
    }
}

impl AnchoredVv {
    pub fn new() -> Self {
        AnchoredVv {
            anchor: "0".to_string(),
            exceptions: VersionVector::new(),
        }
    }

    /// Anchor at a known arrival position with no exceptions. The
    /// text is canonicalized through [`TipStack`]; malformed input
    /// anchors at nothing.
    pub fn at(position: &str) -> Self {
        let anchor = match TipStack::parse(position) {
            Some(stack) if !stack.is_empty() => stack.position(),
            _ => "0".to_string(),
        };
        AnchoredVv {
            anchor,
            exceptions: VersionVector::new(),
        }
    }

    /// Flattened anchor position, `"0"` when nothing is anchored.
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn exceptions(&self) -> &VersionVector {
        &self.exceptions
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == "0" && self.exceptions.is_empty()
    }

    /// True when the op at `position` is known: it arrived at or
    /// before the anchor, or its stamp is a recorded exception.
    pub fn covers(&self, position: &str, stamp: &Stamp) -> bool {
        stamp.is_zero() || position <= self.anchor.as_str() || self.exceptions.covers(stamp)
    }

    /// Move the anchor forward to the arrival position of an absorbed
    /// op (never backward) and drop the exception its stamp subsumes.
    pub fn advance(&mut self, position: &str, stamp: &Stamp) {
        if stamp.is_error() {
            return;
        }
        if position > self.anchor.as_str() {
            if let Some(stack) = TipStack::parse(position) {
                if !stack.is_empty() {
                    self.anchor = stack.position();
                }
            }
        }
        self.exceptions.remove_covered_by(stamp);
    }

    /// Fold a flat acknowledgement vector into the exception set.
    pub fn merge(&mut self, vv: &VersionVector) {
        self.exceptions.merge(vv);
    }

    /// Record a single acknowledged stamp as an exception.
    pub fn note(&mut self, stamp: &Stamp) {
        if !stamp.is_error() {
            self.exceptions.add(stamp);
        }
    }
}

impl fmt::Display for AnchoredVv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exceptions.is_empty() {
            write!(f, "{}", self.anchor)
        } else {
            write!(f, "{};{}", self.anchor, self.exceptions)
        }
    }
}

impl AnchoredVv {
    /// Parse `ANCHOR` or `ANCHOR;EXCEPTIONS`. A malformed anchor
    /// parses as no anchor at all: it covers nothing, which never
    /// claims knowledge the text cannot prove.
    pub fn parse(text: &str) -> Self {
        let (anchor_text, exceptions) = match text.split_once(';') {
            Some((anchor, vv)) => (anchor, VersionVector::parse(vv)),
            None => (text, VersionVector::new()),
        };
        let mut avv = AnchoredVv::at(anchor_text);
        avv.exceptions = exceptions;
        avv
    }
}

impl From<String> for AnchoredVv {
    fn from(text: String) -> Self {
        AnchoredVv::parse(&text)
    }
}

impl From<AnchoredVv> for String {
    fn from(avv: AnchoredVv) -> Self {
        avv.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fresh_vector_covers_only_zero() {
        let avv = AnchoredVv::new();
        assert!(avv.covers("0", &Stamp::zero()));
        assert!(!avv.covers("1+a", &Stamp::parse("1+a")));
    }

    #[test]
    fn anchor_covers_positions_at_or_before_it() {
        let avv = AnchoredVv::at("5+b");
        assert!(avv.covers("4+z", &Stamp::parse("4+z")));
        assert!(avv.covers("5+a", &Stamp::parse("5+a")));
        assert!(avv.covers("5+b", &Stamp::parse("5+b")));
        assert!(!avv.covers("5+c", &Stamp::parse("5+c")));
        assert!(!avv.covers("6+a", &Stamp::parse("6+a")));
    }

    #[test]
    fn a_late_arrival_past_the_anchor_is_not_covered() {
        // 2+b has a smaller stamp than the anchor, but it arrived
        // after it, at the stacked position. It is unknown until
        // acknowledged explicitly.
        let mut avv = AnchoredVv::at("3+c");
        let late = Stamp::parse("2+b");
        assert!(!avv.covers("3+c!2+b", &late));

        avv.note(&late);
        assert!(avv.covers("3+c!2+b", &late));
    }

    #[test]
    fn advance_moves_to_stacked_positions_and_eats_exceptions() {
        let mut avv = AnchoredVv::at("3+c");
        avv.note(&Stamp::parse("2+b"));
        avv.note(&Stamp::parse("9+z"));

        avv.advance("3+c!2+b", &Stamp::parse("2+b"));
        assert_eq!(avv.anchor(), "3+c!2+b");
        // the 2+b exception is subsumed, 9+z is not
        assert!(!avv.exceptions().covers(&Stamp::parse("2+b")));
        assert!(avv.covers("3+c!2+b", &Stamp::parse("2+b"))); // via the anchor
        assert!(avv.exceptions().covers(&Stamp::parse("9+z")));
        assert_eq!(avv.exceptions().len(), 1);
    }

    #[test]
    fn advance_never_moves_backward() {
        let mut avv = AnchoredVv::at("5+a");
        avv.advance("3+a", &Stamp::parse("3+a"));
        assert_eq!(avv.anchor(), "5+a");
    }

    #[test]
    fn merge_keeps_entries_as_exceptions() {
        let mut avv = AnchoredVv::at("5+m");
        avv.merge(&VersionVector::parse("3+a,7+b"));
        assert!(avv.covers("5+m!3+a", &Stamp::parse("3+a")));
        assert!(avv.covers("7+b", &Stamp::parse("7+b")));
    }

    #[test]
    fn text_round_trip() {
        let mut avv = AnchoredVv::at("5+m");
        avv.note(&Stamp::parse("7+b"));
        let text = avv.to_string();
        assert_eq!(text, "5+m;7+b");
        assert_eq!(AnchoredVv::parse(&text), avv);
        assert_eq!(AnchoredVv::parse("5+m"), AnchoredVv::at("5+m"));
        assert_eq!(AnchoredVv::parse("5+m!3+a").anchor(), "5+m!3+a");
        assert_eq!(AnchoredVv::new().to_string(), "0");
    }

    #[test]
    fn malformed_anchors_cover_nothing() {
        let avv = AnchoredVv::parse("not a position;2+b");
        assert_eq!(avv.anchor(), "0");
        assert!(!avv.covers("1+a", &Stamp::parse("1+a")));
        assert!(avv.covers("5+c!2+b", &Stamp::parse("2+b"))); // exception survives
    }

    proptest! {
        /// Advancing the anchor keeps everything it covered before.
        #[test]
        fn advance_is_monotone(
            t1 in 1u64..1000, t2 in 1u64..1000,
            t3 in 1u64..1000,
        ) {
            let anchor = Stamp::new(t1, "a").to_string();
            let next = Stamp::new(t2, "a");
            let sample = Stamp::new(t3, "a");
            let sample_pos = sample.to_string();

            let mut avv = AnchoredVv::at(&anchor);
            let covered_before = avv.covers(&sample_pos, &sample);
            avv.advance(&next.to_string(), &next);
            if covered_before {
                prop_assert!(avv.covers(&sample_pos, &sample));
            }
            prop_assert!(avv.anchor() >= anchor.as_str());
        }
    }
}
