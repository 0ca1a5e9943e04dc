//! Concurrent Reference HashMap Implementation
//!
//! This module implements a segment-partitioned hash map whose entries are
//! reclaimed once their values are no longer referenced, instead of through
//! an explicit eviction policy. It is meant as a memoization cache for
//! expensive derived values: repeated lookups are cheap, and entries nobody
//! uses any more do not accumulate.
//!
//! ## Design
//!
//! The map uses:
//! - A fixed power-of-two array of segments, each with its own mutex
//! - Per-segment power-of-two tables of immutable collision chains
//! - Atomically published tables and chain heads, so `get` never locks
//! - A per-map reclamation queue fed by value drops and explicit removals,
//!   drained opportunistically by segment maintenance
//!
//! A key's mixed hash selects its segment from the high bits and its slot
//! from the low bits, so the two choices are independent.
//!
//! ## Consistency
//!
//! - Operations on the same key are linearized by its segment lock
//! - [`len`](ConcurrentReferenceHashMap::len) sums per-segment counters
//!   without a global lock and may include reclaimed entries that are not
//!   purged yet
//! - Iteration is weakly consistent and never fails on concurrent change
//!
//! ## Example
//!
//! ```rust
//! use reclaim_map::{ConcurrentReferenceHashMap, ReferenceKind};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map: Arc<ConcurrentReferenceHashMap<u32, u32>> =
//!     Arc::new(ConcurrentReferenceHashMap::with_kind(ReferenceKind::Soft));
//!
//! let writer = thread::spawn({
//!     let map = Arc::clone(&map);
//!     move || {
//!         for i in 0..1000u32 {
//!             map.put(i, i * 2);
//!         }
//!     }
//! });
//! writer.join().unwrap();
//!
//! let sum: u32 = (0..1000u32).filter_map(|i| map.get(&i)).map(|v| *v).sum();
//! assert_eq!(sum, 999_000);
//! ```

use super::config::{Config, ReferenceKind, MAXIMUM_CONCURRENCY_LEVEL, MAXIMUM_SEGMENT_SIZE};
use super::iter::{EntrySet, Iter, Keys, Values};
use super::reference::{EntryRef, Reference, ReferenceManager, Tracked};
use super::segment::{Restructure, Segment, TaskKey, TaskOptions};
use crate::metrics::{AtomicMetrics, CacheMetrics, MetricsCollector};
use crate::util::CachePadded;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash, Hasher};
use fxhash::FxBuildHasher;
use log::debug;
use std::sync::Arc;

/// Smallest shift such that `1 << shift` reaches `minimum`, capped at `maximum`
fn calculate_shift(minimum: usize, maximum: usize) -> u32 {
    let mut shift = 0;
    let mut value = 1usize;
    while value < minimum && value < maximum {
        value <<= 1;
        shift += 1;
    }
    shift
}

/// Avalanche-mix a folded key hash so poor distributions still spread
fn mix(mut h: u32) -> u32 {
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

/// A concurrent hash map whose entries are reclaimed with their values
///
/// Values are stored and returned as [`Tracked`] handles. With
/// [`ReferenceKind::Weak`] an entry disappears once the last handle to its
/// value is dropped; with [`ReferenceKind::Soft`] the map keeps values alive
/// until [`relieve_memory_pressure`](Self::relieve_memory_pressure) clears
/// the ones nobody else holds.
///
/// Keys and values may themselves be optional (`Option<T>`): `None` is an
/// ordinary key or value, distinct from the absence of a mapping.
///
/// # Type Parameters
///
/// * `K` - The key type, must implement `Hash + Eq`
/// * `V` - The value type
/// * `S` - The hasher used for keys, `FxBuildHasher` by default
///
/// # Examples
///
/// ```rust
/// use reclaim_map::{ConcurrentReferenceHashMap, ReferenceKind, Tracked};
///
/// let map: ConcurrentReferenceHashMap<&str, String> =
///     ConcurrentReferenceHashMap::with_kind(ReferenceKind::Weak);
/// let value = Tracked::new("formatted".to_string());
/// map.put("key", value.clone());
/// assert_eq!(map.get("key").as_deref().map(String::as_str), Some("formatted"));
///
/// drop(value);
/// map.purge_unreferenced_entries();
/// assert!(map.get("key").is_none());
/// assert_eq!(map.len(), 0);
/// ```
pub struct ConcurrentReferenceHashMap<K, V, S = FxBuildHasher> {
    pub(super) segments: Box<[CachePadded<Segment<K, V>>]>,
    manager: ReferenceManager,
    metrics: AtomicMetrics,
    hasher: S,
    shift: u32,
    load_factor: f32,
}

impl<K, V> ConcurrentReferenceHashMap<K, V>
where
    K: Hash + Eq,
{
    /// Create a map with the default configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reclaim_map::ConcurrentReferenceHashMap;
    ///
    /// let map: ConcurrentReferenceHashMap<u32, String> = ConcurrentReferenceHashMap::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::from_parts(Config::default(), FxBuildHasher::default())
    }

    /// Create a map sized for `initial_capacity` entries
    pub fn with_capacity(initial_capacity: usize) -> Self {
        let config = Config {
            initial_capacity,
            ..Config::default()
        };
        Self::from_parts(config, FxBuildHasher::default())
    }

    /// Create a map with the given reclamation aggressiveness
    pub fn with_kind(reference_kind: ReferenceKind) -> Self {
        let config = Config {
            reference_kind,
            ..Config::default()
        };
        Self::from_parts(config, FxBuildHasher::default())
    }

    /// Create a map from a configuration, validating it first
    pub fn with_config(config: Config) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, FxBuildHasher::default()))
    }
}

impl<K, V> Default for ConcurrentReferenceHashMap<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentReferenceHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Build from an already validated configuration
    pub(crate) fn from_parts(config: Config, hasher: S) -> Self {
        let shift = calculate_shift(config.concurrency_level, MAXIMUM_CONCURRENCY_LEVEL);
        let size = 1usize << shift;
        let rounded_capacity = config.initial_capacity.div_ceil(size);
        let initial_size = 1usize << calculate_shift(rounded_capacity, MAXIMUM_SEGMENT_SIZE);
        let segments = (0..size)
            .map(|index| CachePadded::new(Segment::new(index, initial_size, config.load_factor)))
            .collect();
        debug!(
            "created map with {} segments of {} slots ({:?} references)",
            size, initial_size, config.reference_kind
        );
        Self {
            segments,
            manager: ReferenceManager::new(config.reference_kind, size),
            metrics: AtomicMetrics::default(),
            hasher,
            shift,
            load_factor: config.load_factor,
        }
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Reclamation aggressiveness of this map
    pub fn reference_kind(&self) -> ReferenceKind {
        self.manager.kind()
    }

    /// Load factor shared by every segment
    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    /// Get the value mapped to `key`
    ///
    /// Runs purge-only maintenance on the key's segment when reclaimed
    /// entries are queued, then walks the chain without locking.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reclaim_map::ConcurrentReferenceHashMap;
    ///
    /// let map: ConcurrentReferenceHashMap<u32, &str> = ConcurrentReferenceHashMap::new();
    /// map.put(1, "hello");
    /// assert_eq!(map.get(&1).map(|v| *v), Some("hello"));
    /// assert!(map.get(&2).is_none());
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self
            .get_reference(key, Restructure::WhenNecessary)
            .and_then(|reference| reference.get())
            .map(EntryRef::into_value);
        match value {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        value
    }

    /// Get the value mapped to `key`, or `default` when there is none
    pub fn get_or_default<Q>(&self, key: &Q, default: impl Into<Tracked<V>>) -> Tracked<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).unwrap_or_else(|| default.into())
    }

    /// Whether `key` has a live mapping
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_reference(key, Restructure::WhenNecessary)
            .and_then(|reference| reference.get())
            .is_some()
    }

    /// Map `key` to `value`, returning the previous value
    ///
    /// An existing entry is rebound in place; otherwise a new entry is added.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reclaim_map::ConcurrentReferenceHashMap;
    ///
    /// let map: ConcurrentReferenceHashMap<&str, i32> = ConcurrentReferenceHashMap::new();
    /// assert!(map.put("k", 1).is_none());
    /// assert_eq!(map.put("k", 2).map(|v| *v), Some(1));
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn put(&self, key: K, value: impl Into<Tracked<V>>) -> Option<Tracked<V>> {
        self.put_with(key, value.into(), true)
    }

    /// Map `key` to `value` only if it has no live mapping, returning the
    /// existing value otherwise
    pub fn put_if_absent(&self, key: K, value: impl Into<Tracked<V>>) -> Option<Tracked<V>> {
        self.put_with(key, value.into(), false)
    }

    fn put_with(&self, key: K, value: Tracked<V>, overwrite: bool) -> Option<Tracked<V>> {
        let hash = self.hash(&key);
        self.segment_for(hash).do_task(
            hash,
            TaskKey::owned(key),
            TaskOptions::PUT,
            &self.manager,
            &self.metrics,
            |reference, entry, entries| match (reference, entry) {
                (Some(reference), Some(entry)) => {
                    if overwrite {
                        self.manager.set_value(reference.entry(), value);
                    }
                    Some(entry.into_value())
                }
                _ => {
                    entries.add(value);
                    None
                }
            },
        )
    }

    /// Return the value for `key`, computing and inserting it when absent
    ///
    /// `compute` runs without any segment lock held, so it may itself read or
    /// write the map. Concurrent callers racing on the same absent key may
    /// each run `compute`, but only the first value inserted is kept and every
    /// caller receives that one value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reclaim_map::ConcurrentReferenceHashMap;
    ///
    /// let map: ConcurrentReferenceHashMap<String, usize> = ConcurrentReferenceHashMap::new();
    /// let parsed = map.compute_if_absent("yyyy-MM-dd".to_string(), |pattern| pattern.split('-').count());
    /// assert_eq!(*parsed, 3);
    /// let cached = map.compute_if_absent("yyyy-MM-dd".to_string(), |_| unreachable!());
    /// assert_eq!(*cached, 3);
    /// ```
    pub fn compute_if_absent<F>(&self, key: K, compute: F) -> Tracked<V>
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = Tracked::new(compute(&key));
        // A racing caller may have inserted first; its value wins
        self.put_with(key, value.clone(), false).unwrap_or(value)
    }

    /// Remove the mapping for `key`, returning its value
    pub fn remove<Q>(&self, key: &Q) -> Option<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment_for(hash).do_task(
            hash,
            TaskKey::Borrowed(key),
            TaskOptions::REMOVE,
            &self.manager,
            &self.metrics,
            |reference, entry, _| {
                let entry = entry?;
                self.release(reference);
                Some(entry.into_value())
            },
        )
    }

    /// Remove the mapping for `key` only if its value equals `value`
    pub fn remove_if<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).do_task(
            hash,
            TaskKey::Borrowed(key),
            TaskOptions::REMOVE,
            &self.manager,
            &self.metrics,
            |reference, entry, _| match entry {
                Some(entry) if **entry.value() == *value => {
                    self.release(reference);
                    true
                }
                _ => false,
            },
        )
    }

    /// Rebind `key` to `value` if it has a live mapping, returning the
    /// previous value
    pub fn replace<Q>(&self, key: &Q, value: impl Into<Tracked<V>>) -> Option<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = value.into();
        let hash = self.hash(key);
        self.segment_for(hash).do_task(
            hash,
            TaskKey::Borrowed(key),
            TaskOptions::REPLACE,
            &self.manager,
            &self.metrics,
            |reference, entry, _| {
                let entry = entry?;
                if let Some(reference) = reference {
                    self.manager.set_value(reference.entry(), value);
                }
                Some(entry.into_value())
            },
        )
    }

    /// Rebind `key` to `new_value` only if its value equals `old_value`
    pub fn replace_if<Q>(&self, key: &Q, old_value: &V, new_value: impl Into<Tracked<V>>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let new_value = new_value.into();
        let hash = self.hash(key);
        self.segment_for(hash).do_task(
            hash,
            TaskKey::Borrowed(key),
            TaskOptions::REPLACE,
            &self.manager,
            &self.metrics,
            |reference, entry, _| match (reference, entry) {
                (Some(reference), Some(entry)) if **entry.value() == *old_value => {
                    self.manager.set_value(reference.entry(), new_value);
                    true
                }
                _ => false,
            },
        )
    }

    /// Approximate number of entries
    ///
    /// Sums each segment's counter without a cross-segment lock. Under
    /// concurrent mutation the result is not a snapshot, and it may include
    /// reclaimed entries that have not been purged yet.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.count()).sum()
    }

    /// Whether every segment counter is zero
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.count() == 0)
    }

    /// Remove every entry, one segment at a time
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Purge already reclaimed entries from every segment
    ///
    /// Useful when the map is read far more often than written. This only
    /// makes reclaimed entries disappear from [`len`](Self::len) and
    /// iteration sooner; it does not reclaim anything by itself.
    pub fn purge_unreferenced_entries(&self) {
        for segment in self.segments.iter() {
            segment.restructure_if_necessary(false, &self.manager, &self.metrics);
        }
    }

    /// Clear soft entries whose values are held nowhere outside the map,
    /// then purge them. Returns the number of entries cleared.
    ///
    /// This is the explicit stand-in for memory pressure. Entries whose
    /// values are still held elsewhere stay soft. Weak maps have nothing
    /// to relieve.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reclaim_map::{ConcurrentReferenceHashMap, Tracked};
    ///
    /// let map: ConcurrentReferenceHashMap<&str, i32> = ConcurrentReferenceHashMap::new();
    /// let kept = Tracked::new(1);
    /// map.put("kept", kept.clone());
    /// map.put("dropped", 2);
    ///
    /// assert_eq!(map.relieve_memory_pressure(), 1);
    /// assert_eq!(map.len(), 1);
    /// assert!(map.get("kept").is_some());
    /// ```
    pub fn relieve_memory_pressure(&self) -> usize {
        if self.manager.kind() != ReferenceKind::Soft {
            return 0;
        }
        let cleared: usize = self
            .segments
            .iter()
            .map(|segment| segment.relieve_pressure())
            .sum();
        debug!("memory pressure relieved: {} soft entries cleared", cleared);
        self.purge_unreferenced_entries();
        cleared
    }

    /// Weakly consistent iterator over live entries
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    /// Set-like view of the entries
    pub fn entries(&self) -> EntrySet<'_, K, V, S> {
        EntrySet::new(self)
    }

    /// Iterator over the keys of live entries
    pub fn keys(&self) -> Keys<'_, K, V, S>
    where
        K: Clone,
    {
        Keys::new(self.iter())
    }

    /// Iterator over the values of live entries
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values::new(self.iter())
    }

    fn release(&self, reference: Option<&Reference<K, V>>) {
        if let Some(reference) = reference {
            reference.release();
            self.metrics.record_removal();
        }
    }

    fn get_reference<Q>(&self, key: &Q, restructure: Restructure) -> Option<Arc<Reference<K, V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        self.segment_for(hash)
            .get_reference(key, hash, restructure, &self.manager, &self.metrics)
    }

    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u32 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        mix((hash ^ (hash >> 32)) as u32)
    }

    fn segment_for(&self, hash: u32) -> &Segment<K, V> {
        let index = hash.checked_shr(32 - self.shift).unwrap_or(0) as usize;
        &self.segments[index & (self.segments.len() - 1)]
    }
}

impl<K, V, S> MetricsCollector for ConcurrentReferenceHashMap<K, V, S> {
    fn metrics(&self) -> CacheMetrics {
        self.metrics.snapshot()
    }

    fn reset_metrics(&self) {
        self.metrics.reset();
    }

    fn set_metrics_enabled(&self, enabled: bool) {
        self.metrics.set_enabled(enabled);
    }

    fn is_metrics_enabled(&self) -> bool {
        self.metrics.is_enabled()
    }
}

impl<K, V, S> fmt::Debug for ConcurrentReferenceHashMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentReferenceHashMap")
            .field("segments", &self.segments.len())
            .field("len", &self.segments.iter().map(|s| s.count()).sum::<usize>())
            .field("reference_kind", &self.manager.kind())
            .field("load_factor", &self.load_factor)
            .finish()
    }
}

impl<'a, K, V, S> IntoIterator for &'a ConcurrentReferenceHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    type Item = EntryRef<K, V>;
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
