//! Ordered key-value sets with copy-on-write delta overlays.
//!
//! A [`BaseSet`] holds the committed entries of one store and publishes them
//! as immutable generations. Readers take a [`Snapshot`] (a cheap handle onto
//! the current generation) and are never blocked by, nor able to observe, the
//! writer. The writer opens a [`Delta`], which records pending inserts,
//! in-place modifications, and removals in three disjoint maps; reads through
//! the delta see the overlay merged over the snapshot it was opened on.
//! Committing a delta builds a fresh generation and publishes it with one
//! atomic swap, so a concurrent reader sees either the fully-old or the
//! fully-new state.

#![deny(missing_docs)]

mod base_set;
mod delta;

pub use base_set::{BaseSet, Snapshot};
pub use delta::{Delta, DeltaChanges, ElementError, InsertOutcome, Iter, RemoveOutcome};
