//! Lamport-style hybrid timestamps.
//!
//! A [`Stamp`] is a `(time, origin)` pair: a 60-bit calendar-correlated
//! value plus the replica identifier that issued it. Stamps are totally
//! ordered by time with the origin as tie-breaker, and their textual
//! form (`TIME+ORIGIN`) sorts exactly like the pair itself because the
//! time digits are rendered in the order-preserving base64 alphabet.
//!
//! Parsing never fails across a session boundary: a malformed string
//! yields the distinguished error stamp, which any caller can test
//! with [`Stamp::is_error`].

use crate::base64;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Origin carried by the error stamp; sorts above every real origin.
pub const ERROR_ORIGIN: &str = "~~~~~~~~~~";

/// An immutable `(time, origin)` event identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Stamp {
    time: u64,
    origin: String,
}

impl Stamp {
    /// The zero stamp: renders as `"0"`, precedes everything.
    pub fn zero() -> Self {
        Stamp {
            time: 0,
            origin: String::new(),
        }
    }

    /// The error stamp produced by failed parses.
    pub fn error() -> Self {
        Stamp {
            time: base64::MAX_VALUE,
            origin: ERROR_ORIGIN.to_string(),
        }
    }

    /// Build a stamp from raw parts. The time is masked to 60 bits.
    pub fn new(time: u64, origin: impl Into<String>) -> Self {
        Stamp {
            time: time & base64::MAX_VALUE,
            origin: origin.into(),
        }
    }

    /// Parse `TIME+ORIGIN` (or bare `0`). Malformed input yields the
    /// error stamp rather than an `Err`.
    pub fn parse(text: &str) -> Self {
        if text == "0" {
            return Stamp::zero();
        }
        let (time_text, origin) = match text.split_once('+') {
            Some((t, o)) => (t, o),
            None => (text, ""),
        };
        let time = match base64::decode(time_text) {
            Some(t) => t,
            None => return Stamp::error(),
        };
        if !origin.is_empty() && base64::decode(origin).is_none() {
            return Stamp::error();
        }
        Stamp::new(time, origin)
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_zero(&self) -> bool {
        self.time == 0 && self.origin.is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.origin == ERROR_ORIGIN
    }

    /// A stamp with the same time but a different origin.
    pub fn with_origin(&self, origin: impl Into<String>) -> Self {
        Stamp::new(self.time, origin)
    }

    /// Truncate the `n` least significant time digits, as long as the
    /// result stays strictly above `floor`. Serialized stamps stay
    /// short when the clock's resolution exceeds the event rate.
    pub fn relaxed(&self, floor: &Stamp) -> Self {
        let mut best = self.time;
        for n in 1..base64::MAX_DIGITS {
            let candidate = base64::truncate(self.time, n);
            if candidate > floor.time {
                best = candidate;
            } else {
                break;
            }
        }
        Stamp::new(best, self.origin.clone())
    }
}

impl Default for Stamp {
    fn default() -> Self {
        Stamp::zero()
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        write!(f, "{}", base64::encode(self.time))?;
        if !self.origin.is_empty() {
            write!(f, "+{}", self.origin)?;
        }
        Ok(())
    }
}

impl From<String> for Stamp {
    fn from(text: String) -> Self {
        Stamp::parse(&text)
    }
}

impl From<Stamp> for String {
    fn from(stamp: Stamp) -> Self {
        stamp.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_round_trips() {
        let z = Stamp::zero();
        assert!(z.is_zero());
        assert_eq!(z.to_string(), "0");
        assert_eq!(Stamp::parse("0"), z);
    }

    #[test]
    fn parse_and_render() {
        let s = Stamp::parse("1CQKn+replica1");
        assert!(!s.is_error());
        assert_eq!(s.origin(), "replica1");
        assert_eq!(s.to_string(), "1CQKn+replica1");
    }

    #[test]
    fn malformed_input_yields_error_stamp() {
        assert!(Stamp::parse("no spaces!").is_error());
        assert!(Stamp::parse("+noclock").is_error());
        assert!(Stamp::parse("1CQKn+bad origin").is_error());
        // the error stamp still displays and re-parses as itself
        let e = Stamp::error();
        assert_eq!(Stamp::parse(&e.to_string()), e);
    }

    #[test]
    fn order_is_time_then_origin() {
        let a = Stamp::parse("5+a");
        let b = Stamp::parse("5+b");
        let c = Stamp::parse("6+a");
        assert!(a < b);
        assert!(b < c);
        assert!(Stamp::zero() < a);
        assert!(c < Stamp::error());
    }

    #[test]
    fn relaxed_stays_above_floor() {
        let s = Stamp::parse("1CQKn7+r");
        let floor = Stamp::parse("1CQ+r");
        let relaxed = s.relaxed(&floor);
        assert!(relaxed > floor);
        assert!(relaxed <= s);
        assert_eq!(relaxed.to_string(), "1CQK+r");
    }

    #[test]
    fn relaxed_keeps_full_precision_next_to_floor() {
        let s = Stamp::parse("1CQKn7+r");
        let floor = Stamp::parse("1CQKn6+r");
        assert_eq!(s.relaxed(&floor), s);
    }

    proptest! {
        #[test]
        fn display_parse_round_trip(time in 0u64..(1 << 60), origin in "[0-9A-Za-z_]{1,8}") {
            let s = Stamp::new(time, origin);
            prop_assert_eq!(Stamp::parse(&s.to_string()), s);
        }

        #[test]
        fn text_order_matches_stamp_order(
            t1 in 0u64..(1 << 60), t2 in 0u64..(1 << 60),
            o in "[0-9a-z]{1,4}",
        ) {
            // same origin: string compare must agree with stamp compare
            let a = Stamp::new(t1, o.clone());
            let b = Stamp::new(t2, o);
            prop_assert_eq!(a.to_string().cmp(&b.to_string()), a.cmp(&b));
        }
    }
}
