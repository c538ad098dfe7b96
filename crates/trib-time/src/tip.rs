//! Arrival-order tip with reordering tolerance.
//!
//! The record store is append-only: a position, once written, can
//! never be renumbered. The canonical arrival order is therefore a
//! single scalar stamp in the common case, escalating to a stack of
//! stamps when an op legitimately arrives with a stamp *below* the
//! current tip. The stack stays monotone-decreasing from bottom to
//! top, so its flattened text form keeps growing lexicographically
//! with every insertion, exactly what an append-only key space needs.
//!
//! Readers must treat the whole stack as the effective position, not
//! just its top.

use crate::stamp::Stamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between stacked stamps in the flattened text form.
pub const JOIN: char = '!';

/// The arrival-order marker: a stack of stamps, newest on top.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipStack {
    /// Bottom first; strictly decreasing toward the top (the end).
    stack: Vec<Stamp>,
}

impl TipStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// The most recently inserted stamp.
    pub fn top(&self) -> Option<&Stamp> {
        self.stack.last()
    }

    /// The greatest stamp ever inserted (the stack's bottom).
    pub fn max(&self) -> Option<&Stamp> {
        self.stack.first()
    }

    /// Insert the stamp of a newly stored op: pop every entry smaller
    /// than it, then push. An in-order arrival collapses the stack
    /// back to a single stamp.
    pub fn insert(&mut self, stamp: &Stamp) {
        while matches!(self.stack.last(), Some(top) if *top < *stamp) {
            self.stack.pop();
        }
        self.stack.push(stamp.clone());
    }

    /// The flattened position text (`"0"` while empty). Grows
    /// lexicographically with every insertion.
    pub fn position(&self) -> String {
        if self.stack.is_empty() {
            return "0".to_string();
        }
        let mut out = String::new();
        for (i, stamp) in self.stack.iter().enumerate() {
            if i > 0 {
                out.push(JOIN);
            }
            out.push_str(&stamp.to_string());
        }
        out
    }

    /// Parse a flattened position. `None` on any malformed component;
    /// `"0"` parses to the empty stack.
    pub fn parse(text: &str) -> Option<Self> {
        if text == "0" || text.is_empty() {
            return Some(TipStack::new());
        }
        let mut stack = Vec::new();
        for part in text.split(JOIN) {
            let stamp = Stamp::parse(part);
            if stamp.is_error() {
                return None;
            }
            stack.push(stamp);
        }
        Some(TipStack { stack })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stamp> {
        self.stack.iter()
    }
}

impl fmt::Display for TipStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Stamp {
        Stamp::parse(text)
    }

    #[test]
    fn in_order_arrivals_stay_scalar() {
        let mut tip = TipStack::new();
        tip.insert(&s("1+a"));
        tip.insert(&s("2+b"));
        tip.insert(&s("3+a"));
        assert_eq!(tip.len(), 1);
        assert_eq!(tip.position(), "3+a");
    }

    #[test]
    fn out_of_order_arrival_grows_the_stack() {
        let mut tip = TipStack::new();
        tip.insert(&s("3+a"));
        tip.insert(&s("2+b"));
        assert_eq!(tip.len(), 2);
        assert_eq!(tip.position(), "3+a!2+b");
        assert_eq!(tip.top(), Some(&s("2+b")));
        assert_eq!(tip.max(), Some(&s("3+a")));
    }

    #[test]
    fn later_arrival_pops_smaller_entries() {
        let mut tip = TipStack::new();
        tip.insert(&s("5+a"));
        tip.insert(&s("2+b"));
        tip.insert(&s("3+c"));
        assert_eq!(tip.position(), "5+a!3+c");
        tip.insert(&s("7+b"));
        assert_eq!(tip.position(), "7+b");
    }

    #[test]
    fn positions_grow_lexicographically() {
        let mut tip = TipStack::new();
        let mut prev = tip.position();
        for stamp in ["5+a", "2+b", "4+c", "9+a", "8+b"] {
            tip.insert(&s(stamp));
            let next = tip.position();
            assert!(next > prev, "{} !> {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn position_round_trips() {
        let mut tip = TipStack::new();
        tip.insert(&s("3+a"));
        tip.insert(&s("2+b"));
        assert_eq!(TipStack::parse(&tip.position()), Some(tip));
        assert_eq!(TipStack::parse("0"), Some(TipStack::new()));
        assert_eq!(TipStack::parse("not a!position"), None);
    }
}
