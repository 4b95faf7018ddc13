//! Map implementations
//!
//! This module provides concurrent map implementations optimized for
//! read-dominated access patterns.
//!
//! ## Available Maps
//!
//! - [`SnapshotMap`]: lock-free reads against an immutable snapshot, with a
//!   mutex-guarded overlay absorbing new keys and deletions
//!
//! ## Choosing a Map
//!
//! - Use `SnapshotMap` when reads dominate and the key set is mostly stable;
//!   a key that has been read once from the snapshot costs no lock at all
//! - For write-heavy workloads with an ever-changing key set, a plain
//!   `Mutex<HashMap>` can be the better tradeoff, since the overlay mutex
//!   would be taken on most operations anyway

pub mod snapshot;

pub use self::snapshot::SnapshotMap;


#[cfg(test)]
mod proptests;
