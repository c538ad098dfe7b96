//! Causal-time primitives for the tributary replication engine.
//!
//! Everything in the engine is ordered by [`Stamp`]s: Lamport-style
//! hybrid timestamps whose textual form sorts exactly like their
//! numeric form. On top of the stamp sit the structures the session
//! layer reasons with:
//!
//! - [`Clock`] issues strictly increasing stamps and folds observed
//!   remote stamps into its own notion of "now".
//! - [`VersionVector`] is the flat per-origin "seen up to" map.
//! - [`AnchoredVv`] compresses a history acknowledgement into one
//!   anchor position plus a small set of exceptions beyond it.
//! - [`TipStack`] is the append-only arrival-order marker that stays
//!   a single stamp until an out-of-order delivery forces a stack.

pub mod anchored;
pub mod base64;
pub mod clock;
pub mod stamp;
pub mod tip;
pub mod vv;

pub use anchored::AnchoredVv;
pub use clock::{Clock, ClockMode};
pub use stamp::Stamp;
pub use tip::TipStack;
pub use vv::VersionVector;
