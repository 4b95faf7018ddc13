//! # snapmap
//!
//! A concurrency-safe associative store optimized for read-dominated workloads
//! over a mostly-stable key set.
//!
//! ## Features
//!
//! - **Lock-free reads**: `load` and `range` consult an immutable snapshot
//!   without taking any lock
//! - **Single-mutex writes**: new keys and deletions go through a small
//!   lock-guarded overlay that is periodically folded into a fresh snapshot
//! - **Per-key atomicity**: `load_or_store`, `load_and_delete`,
//!   `compare_and_swap` and friends are linearizable per key
//!
//! ## Philosophy
//!
//! snapmap focuses on providing:
//! - A total API: every operation always succeeds; "not found" is a normal
//!   outcome, never an error
//! - Safety guarantees enforced through Rust's type system rather than
//!   runtime checks
//! - Predictable behavior under contention, with writer coordination kept
//!   deliberately simple
//!
//! ## Quick Start
//!
//! ```rust
//! use snapmap::SnapshotMap;
//!
//! let map: SnapshotMap<String, i32> = SnapshotMap::new();
//! map.store("answer".to_string(), 42);
//! assert_eq!(map.load(&"answer".to_string()), Some(42));
//! ```
//!
//! ## Thread Safety
//!
//! `SnapshotMap` is safe to share across threads behind an `Arc` without any
//! additional synchronization. Values cross the API boundary by clone, so no
//! external alias into internal storage ever exists.
//!
//! ## Performance
//!
//! snapmap is optimized for modern multi-core processors with attention to:
//! - Cache-line alignment of the hot read pointer and the overlay mutex
//! - Acquire/Release memory ordering on every published value
//! - Amortized promotion of the overlay so steady-state reads stay lock-free

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod map;

pub use crate::map::SnapshotMap;

/// Common utilities and helper types
pub mod util {
    /// Cache line size for alignment purposes
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Pad a struct to cache line size
    ///
    /// Used for the snapshot pointer and the overlay mutex so that reader
    /// traffic on one never invalidates the cache line of the other.
    #[repr(align(64))]
    pub struct CachePadded<T> {
        value: T,
    }

    impl<T> CachePadded<T> {
        /// Create a new cache-padded value
        #[inline]
        pub const fn new(value: T) -> Self {
            Self { value }
        }

        /// Get a reference to the inner value
        #[inline]
        pub const fn get(&self) -> &T {
            &self.value
        }

        /// Get a mutable reference to the inner value
        #[inline]
        pub fn get_mut(&mut self) -> &mut T {
            &mut self.value
        }

        /// Get the inner value
        #[inline]
        pub fn into_inner(self) -> T {
            self.value
        }
    }

    impl<T: Clone> Clone for CachePadded<T> {
        fn clone(&self) -> Self {
            Self::new(self.value.clone())
        }
    }

    impl<T: core::fmt::Debug> core::fmt::Debug for CachePadded<T> {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            core::fmt::Debug::fmt(&self.value, f)
        }
    }
}
