//! Causality tracking for syncable records.
//!
//! Every record carries a [`VectorClock`] mapping each device that wrote it
//! to the record version that device last produced. Comparing two clocks
//! tells the conflict resolver whether one state supersedes the other or
//! whether two devices edited concurrently.
//!
//! Merge satisfies the usual lattice properties:
//! - **Commutative**: merge(a, b) == merge(b, a)
//! - **Associative**: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - **Idempotent**: merge(a, a) == a

mod vector_clock;

pub use vector_clock::{CausalOrder, VectorClock};
