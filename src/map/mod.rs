//! Map implementations
//!
//! This module provides [`ConcurrentReferenceHashMap`], a segment-partitioned
//! concurrent map whose entries live only as long as their values are
//! referenced.
//!
//! ## Layout
//!
//! - `config`: construction parameters, [`Builder`] and defaults
//! - `reference`: value handles, chain nodes and the reclamation queue
//! - `segment`: one locked shard with its resizable table
//! - `concurrent`: the map façade routing keys to segments
//! - `iter`: weakly consistent iterators and the entry-set view
//!
//! ## Choosing a Reference Kind
//!
//! - Use [`ReferenceKind::Weak`] when callers hold the values they care about
//!   and the map should never extend a value's lifetime
//! - Use [`ReferenceKind::Soft`] for caches that should retain values until
//!   memory pressure is relieved explicitly

pub mod concurrent;
mod config;
mod iter;
mod reference;
mod segment;

#[cfg(test)]
mod loom_tests;
#[cfg(test)]
mod proptests;
#[cfg(test)]
mod tests;

pub use self::concurrent::ConcurrentReferenceHashMap;
pub use self::config::{
    Builder, Config, ReferenceKind, DEFAULT_CONCURRENCY_LEVEL, DEFAULT_INITIAL_CAPACITY,
    DEFAULT_LOAD_FACTOR, MAXIMUM_CONCURRENCY_LEVEL, MAXIMUM_SEGMENT_SIZE,
};
pub use self::iter::{EntrySet, Iter, Keys, Values};
pub use self::reference::{EntryRef, Tracked};
