//! # reclaim_map
//!
//! A concurrent hash map whose entries are reclaimed once their values are no
//! longer referenced anywhere else, designed as a thread-safe memoization
//! cache for expensive derived values.
//!
//! ## Features
//!
//! - **Segmented locking**: writers to different segments never contend
//! - **Lock-free reads**: lookups walk atomically published, immutable chains
//! - **Reachability-driven reclamation**: entries disappear with their values
//!   instead of through an eviction policy
//! - **Weakly consistent iteration**: traversal never fails under concurrent
//!   modification and never yields reclaimed entries
//!
//! ## Quick Start
//!
//! ```rust
//! use reclaim_map::{ConcurrentReferenceHashMap, ReferenceKind};
//!
//! let cache: ConcurrentReferenceHashMap<String, usize> =
//!     ConcurrentReferenceHashMap::with_kind(ReferenceKind::Soft);
//!
//! let fields = cache.compute_if_absent("yyyy-MM-dd".to_string(), |p| p.split('-').count());
//! assert_eq!(*fields, 3);
//! assert!(cache.contains_key("yyyy-MM-dd"));
//! ```
//!
//! ## Reclamation
//!
//! Values are held as [`Tracked`] handles. A [`ReferenceKind::Weak`] map lets
//! an entry go as soon as the last outside handle to its value is dropped. A
//! [`ReferenceKind::Soft`] map keeps every value alive until
//! [`relieve_memory_pressure`](ConcurrentReferenceHashMap::relieve_memory_pressure)
//! clears the ones nobody else holds. Reclaimed entries are purged lazily by
//! later writes, or eagerly by
//! [`purge_unreferenced_entries`](ConcurrentReferenceHashMap::purge_unreferenced_entries).
//!
//! ## Thread Safety
//!
//! The map is `Send + Sync` for thread-safe keys and values and is meant to be
//! shared behind an `Arc`. No operation holds more than one segment lock.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod map;
pub mod metrics;

pub use crate::map::{
    Builder, Config, ConcurrentReferenceHashMap, EntryRef, EntrySet, Iter, Keys, ReferenceKind,
    Tracked, Values,
};
pub use crate::metrics::{CacheMetrics, MetricsCollector};

/// Common utilities and helper types
pub(crate) mod util {
    use core::ops::Deref;

    /// Pad a value to its own cache line
    #[repr(align(64))]
    pub(crate) struct CachePadded<T> {
        value: T,
    }

    impl<T> CachePadded<T> {
        #[inline]
        pub(crate) const fn new(value: T) -> Self {
            Self { value }
        }
    }

    impl<T> Deref for CachePadded<T> {
        type Target = T;

        #[inline]
        fn deref(&self) -> &T {
            &self.value
        }
    }
}

/// Error types for map construction and iteration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Load factor was zero, negative or not finite
    #[error("load factor must be positive and finite, got {0}")]
    InvalidLoadFactor(f32),
    /// Concurrency level was zero
    #[error("concurrency level must be at least 1")]
    InvalidConcurrencyLevel,
    /// `remove_current` was called with no current entry
    #[error("no current entry to remove")]
    NoCurrentEntry,
}

/// Result type for map operations
pub type Result<T> = core::result::Result<T, Error>;
