//! Weakly consistent traversal of a [`ConcurrentReferenceHashMap`]
//!
//! Iterators walk segments in order, each segment's published table slot by
//! slot, and each slot's chain node by node. Tables and chains are immutable
//! snapshots, so a traversal never observes a half-built structure and never
//! fails when the map changes underneath it. Insertions and removals that
//! race with a traversal may or may not be seen; reclaimed entries are never
//! yielded.
//!
//! [`ConcurrentReferenceHashMap`]: super::ConcurrentReferenceHashMap

use super::concurrent::ConcurrentReferenceHashMap;
use super::reference::{Entry, EntryRef, Reference, Tracked};
use super::segment::Table;
use crate::{Error, Result};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::iter::FusedIterator;
use fxhash::FxBuildHasher;
use std::sync::Arc;

/// Iterator over the live entries of a map
///
/// Created by [`ConcurrentReferenceHashMap::iter`].
///
/// # Examples
///
/// ```rust
/// use reclaim_map::ConcurrentReferenceHashMap;
///
/// let map: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::new();
/// for i in 0..10 {
///     map.put(i, i);
/// }
///
/// let mut iter = map.iter();
/// while let Some(entry) = iter.next() {
///     if *entry.key() % 2 == 0 {
///         iter.remove_current()?;
///     }
/// }
/// assert_eq!(map.len(), 5);
/// # Ok::<(), reclaim_map::Error>(())
/// ```
pub struct Iter<'a, K, V, S = FxBuildHasher> {
    map: &'a ConcurrentReferenceHashMap<K, V, S>,
    next_segment: usize,
    table: Option<Arc<Table<K, V>>>,
    next_slot: usize,
    reference: Option<Arc<Reference<K, V>>>,
    last: Option<Arc<Entry<K, V>>>,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    pub(crate) fn new(map: &'a ConcurrentReferenceHashMap<K, V, S>) -> Self {
        Self {
            map,
            next_segment: 0,
            table: None,
            next_slot: 0,
            reference: None,
            last: None,
        }
    }

    // Move to the next chain head, loading the next non-empty segment's
    // table when the current one is exhausted. Returns false at the end.
    fn advance_slot(&mut self) -> bool {
        loop {
            if let Some(table) = &self.table {
                if self.next_slot < table.len() {
                    self.reference = table.head(self.next_slot);
                    self.next_slot += 1;
                    return true;
                }
            }
            let Some(segment) = self.map.segments.get(self.next_segment) else {
                self.table = None;
                return false;
            };
            self.next_segment += 1;
            self.next_slot = 0;
            self.table = (segment.count() > 0).then(|| segment.table());
        }
    }
}

impl<K, V, S> Iter<'_, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Remove the entry most recently yielded by [`next`](Iterator::next)
    /// through the map's `remove`, returning the value it removed
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentEntry`] before the first advance, or when the
    /// current entry has already been removed through this iterator. Running
    /// off the end keeps the last yielded entry current.
    pub fn remove_current(&mut self) -> Result<Option<Tracked<V>>> {
        let entry = self.last.take().ok_or(Error::NoCurrentEntry)?;
        Ok(self.map.remove(entry.key()))
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S> {
    type Item = EntryRef<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reference.take() {
                Some(reference) => {
                    self.reference = reference.next().cloned();
                    if let Some(entry) = reference.get() {
                        self.last = Some(Arc::clone(entry.entry()));
                        return Some(entry);
                    }
                }
                None => {
                    if !self.advance_slot() {
                        return None;
                    }
                }
            }
        }
    }
}

impl<K, V, S> FusedIterator for Iter<'_, K, V, S> {}

impl<K, V, S> fmt::Debug for Iter<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("next_segment", &self.next_segment)
            .field("next_slot", &self.next_slot)
            .field("has_current", &self.last.is_some())
            .finish()
    }
}

/// Iterator over the keys of live entries
#[derive(Debug)]
pub struct Keys<'a, K, V, S = FxBuildHasher> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Keys<'a, K, V, S> {
    pub(crate) fn new(inner: Iter<'a, K, V, S>) -> Self {
        Self { inner }
    }
}

impl<K: Clone, V, S> Iterator for Keys<'_, K, V, S> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.inner.next().map(|entry| entry.key().clone())
    }
}

/// Iterator over the values of live entries
#[derive(Debug)]
pub struct Values<'a, K, V, S = FxBuildHasher> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Values<'a, K, V, S> {
    pub(crate) fn new(inner: Iter<'a, K, V, S>) -> Self {
        Self { inner }
    }
}

impl<K, V, S> Iterator for Values<'_, K, V, S> {
    type Item = Tracked<V>;

    fn next(&mut self) -> Option<Tracked<V>> {
        self.inner.next().map(EntryRef::into_value)
    }
}

/// Set-like view of a map's entries
///
/// Every operation delegates to the map, so the view always reflects its
/// current contents.
#[derive(Debug)]
pub struct EntrySet<'a, K, V, S = FxBuildHasher> {
    map: &'a ConcurrentReferenceHashMap<K, V, S>,
}

impl<'a, K, V, S> EntrySet<'a, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'a ConcurrentReferenceHashMap<K, V, S>) -> Self {
        Self { map }
    }

    /// Iterate the entries
    pub fn iter(&self) -> Iter<'a, K, V, S> {
        Iter::new(self.map)
    }

    /// Approximate number of entries, as [`ConcurrentReferenceHashMap::len`]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `key` is currently mapped to a value equal to `value`
    pub fn contains<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.map.get(key).is_some_and(|current| *current == *value)
    }

    /// Remove the entry if `key` is mapped to a value equal to `value`
    pub fn remove<Q>(&self, key: &Q, value: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        self.map.remove_if(key, value)
    }

    /// Clear the map
    pub fn clear(&self) {
        self.map.clear();
    }
}

impl<'a, K, V, S> IntoIterator for &EntrySet<'a, K, V, S>
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
