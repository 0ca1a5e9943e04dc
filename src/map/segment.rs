//! One independently locked shard of a [`ConcurrentReferenceHashMap`]
//!
//! A segment owns a power-of-two table of collision chains. The table is
//! published through an atomic pointer: readers load it and walk chains
//! without locking, and observe a concurrent resize as either the old or the
//! new table, never a partially built one. Every structural change (adding a
//! node, purging, resizing, clearing) happens under the segment's mutex.
//!
//! [`ConcurrentReferenceHashMap`]: super::ConcurrentReferenceHashMap

use super::config::MAXIMUM_SEGMENT_SIZE;
use super::reference::{EntryRef, Reference, ReferenceManager, Tracked};
use crate::metrics::AtomicMetrics;
use arc_swap::{ArcSwap, ArcSwapOption};
use core::borrow::Borrow;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;

/// Whether a lookup may first run purge-only maintenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Restructure {
    WhenNecessary,
    Never,
}

/// Policy flags for [`Segment::do_task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskOptions {
    restructure_before: bool,
    restructure_after: bool,
    skip_if_empty: bool,
    resize: bool,
}

impl TaskOptions {
    /// Tasks that may add an entry
    pub(crate) const PUT: Self = Self {
        restructure_before: true,
        restructure_after: false,
        skip_if_empty: false,
        resize: true,
    };
    /// Tasks that may release an entry
    pub(crate) const REMOVE: Self = Self {
        restructure_before: false,
        restructure_after: true,
        skip_if_empty: true,
        resize: false,
    };
    /// Tasks that only rebind an existing entry
    pub(crate) const REPLACE: Self = Self {
        restructure_before: true,
        restructure_after: false,
        skip_if_empty: true,
        resize: false,
    };
}

/// The key a task looks up; owned when the task may insert it
pub(crate) enum TaskKey<'q, K, Q: ?Sized> {
    Owned(K),
    Borrowed(&'q Q),
}

impl<K> TaskKey<'_, K, K> {
    pub(crate) fn owned(key: K) -> Self {
        Self::Owned(key)
    }
}

impl<K: Borrow<Q>, Q: ?Sized> TaskKey<'_, K, Q> {
    fn lookup(&self) -> &Q {
        match self {
            Self::Owned(key) => key.borrow(),
            Self::Borrowed(key) => key,
        }
    }
}

pub(crate) struct Table<K, V> {
    slots: Box<[ArcSwapOption<Reference<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    fn from_heads(heads: Vec<Option<Arc<Reference<K, V>>>>) -> Self {
        Self {
            slots: heads.into_iter().map(ArcSwapOption::new).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, hash: u32) -> usize {
        hash as usize & (self.slots.len() - 1)
    }

    pub(crate) fn head(&self, index: usize) -> Option<Arc<Reference<K, V>>> {
        self.slots[index].load_full()
    }
}

fn chain<K, V>(head: Option<Arc<Reference<K, V>>>) -> impl Iterator<Item = Arc<Reference<K, V>>> {
    core::iter::successors(head, |reference| reference.next().cloned())
}

fn find_in_chain<K, V, Q>(
    head: Option<Arc<Reference<K, V>>>,
    key: &Q,
    hash: u32,
) -> Option<Arc<Reference<K, V>>>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    chain(head).find(|reference| {
        reference.hash() == hash && reference.is_live() && reference.key().borrow() == key
    })
}

fn threshold(len: usize, load_factor: f32) -> usize {
    (len as f32 * load_factor) as usize
}

/// Lets a task append a fresh reference when it decides one is needed
///
/// Adding is only possible for owned keys and only while the task runs under
/// the segment lock.
pub(crate) struct Entries<'a, 'q, K, V, Q: ?Sized> {
    segment: &'a Segment<K, V>,
    manager: &'a ReferenceManager,
    metrics: &'a AtomicMetrics,
    // None when an empty segment skipped the lock
    slot: Option<(&'a Table<K, V>, usize)>,
    hash: u32,
    key: TaskKey<'q, K, Q>,
}

impl<K, V, Q: ?Sized> Entries<'_, '_, K, V, Q> {
    /// Prepend a new entry for the task's key to its chain, returning
    /// whether it was added
    pub(crate) fn add(self, value: Tracked<V>) -> bool {
        let (Some((table, index)), TaskKey::Owned(key)) = (self.slot, self.key) else {
            return false;
        };
        let entry = self.manager.new_entry(self.segment.index, key, value);
        let reference = self.manager.create_reference(entry, self.hash, table.head(index));
        table.slots[index].store(Some(reference));
        self.segment.count.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_insertion();
        true
    }
}

pub(crate) struct Segment<K, V> {
    index: usize,
    lock: Mutex<()>,
    table: ArcSwap<Table<K, V>>,
    // May transiently include reclaimed references that are not purged yet
    count: AtomicUsize,
    resize_threshold: AtomicUsize,
    initial_size: usize,
    load_factor: f32,
}

impl<K, V> Segment<K, V> {
    pub(crate) fn new(index: usize, initial_size: usize, load_factor: f32) -> Self {
        Self {
            index,
            lock: Mutex::new(()),
            table: ArcSwap::from_pointee(Table::new(initial_size)),
            count: AtomicUsize::new(0),
            resize_threshold: AtomicUsize::new(threshold(initial_size, load_factor)),
            initial_size,
            load_factor,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// The currently published table
    pub(crate) fn table(&self) -> Arc<Table<K, V>> {
        self.table.load_full()
    }

    pub(crate) fn get_reference<Q>(
        &self,
        key: &Q,
        hash: u32,
        restructure: Restructure,
        manager: &ReferenceManager,
        metrics: &AtomicMetrics,
    ) -> Option<Arc<Reference<K, V>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if restructure == Restructure::WhenNecessary {
            self.restructure_if_necessary(false, manager, metrics);
        }
        if self.count() == 0 {
            return None;
        }
        let table = self.table.load();
        find_in_chain(table.head(table.index(hash)), key, hash)
    }

    /// Run `task` against the current reference for `key` under the lock
    ///
    /// The task receives the matching live reference and entry, if any, and
    /// an [`Entries`] handle through which it may add a new reference. With
    /// `skip_if_empty`, an empty segment runs the task with nothing found and
    /// without locking; adding is then refused.
    pub(crate) fn do_task<'q, Q, T, F>(
        &self,
        hash: u32,
        key: TaskKey<'q, K, Q>,
        options: TaskOptions,
        manager: &ReferenceManager,
        metrics: &AtomicMetrics,
        task: F,
    ) -> T
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(Option<&Reference<K, V>>, Option<EntryRef<K, V>>, Entries<'_, 'q, K, V, Q>) -> T,
    {
        if options.restructure_before {
            self.restructure_if_necessary(options.resize, manager, metrics);
        }
        if options.skip_if_empty && self.count() == 0 {
            let entries = Entries {
                segment: self,
                manager,
                metrics,
                slot: None,
                hash,
                key,
            };
            return task(None, None, entries);
        }

        let result = {
            let _guard = self.lock.lock();
            let table = self.table.load_full();
            let index = table.index(hash);
            let reference = find_in_chain(table.head(index), key.lookup(), hash);
            let entry = reference.as_ref().and_then(|reference| reference.get());
            let entries = Entries {
                segment: self,
                manager,
                metrics,
                slot: Some((&*table, index)),
                hash,
                key,
            };
            task(reference.as_deref(), entry, entries)
        };

        if options.restructure_after {
            self.restructure_if_necessary(options.resize, manager, metrics);
        }
        result
    }

    /// Replace the table with an empty one of the initial size
    pub(crate) fn clear(&self) {
        if self.count() == 0 {
            return;
        }
        let discarded = {
            let _guard = self.lock.lock();
            let discarded = self.table.swap(Arc::new(Table::new(self.initial_size)));
            self.resize_threshold
                .store(threshold(self.initial_size, self.load_factor), Ordering::Release);
            self.count.store(0, Ordering::Release);
            for slot in discarded.slots.iter() {
                chain(slot.load_full()).for_each(|reference| reference.detach());
            }
            discarded
        };
        // Values freed by the old table are dropped outside the lock
        drop(discarded);
    }

    /// Clear soft entries whose values are held nowhere else, returning the
    /// number cleared. The replaced bindings are dropped after the lock is
    /// released, which queues the entries for purging.
    pub(crate) fn relieve_pressure(&self) -> usize {
        let cleared: Vec<_> = {
            let _guard = self.lock.lock();
            let table = self.table.load_full();
            table
                .slots
                .iter()
                .flat_map(|slot| chain(slot.load_full()))
                .filter_map(|reference| reference.entry().soften())
                .collect()
        };
        cleared.len()
    }

    /// Purge reclaimed references and, when allowed, grow the table
    ///
    /// Returns without locking when nothing is queued for purging and no
    /// resize is due.
    pub(crate) fn restructure_if_necessary(
        &self,
        allow_resize: bool,
        manager: &ReferenceManager,
        metrics: &AtomicMetrics,
    ) {
        let count = self.count();
        let needs_resize =
            allow_resize && count > 0 && count >= self.resize_threshold.load(Ordering::Acquire);
        let reclaimed = manager.poll_for_purge(self.index);
        if reclaimed.is_some() || needs_resize {
            self.restructure(allow_resize, reclaimed.is_some(), manager, metrics);
        }
    }

    fn restructure(
        &self,
        allow_resize: bool,
        polled: bool,
        manager: &ReferenceManager,
        metrics: &AtomicMetrics,
    ) {
        let _guard = self.lock.lock();

        let mut pending = usize::from(polled);
        while manager.poll_for_purge(self.index).is_some() {
            pending += 1;
        }
        let expected = self.count().saturating_sub(pending);
        let needs_resize = expected > 0 && expected >= self.resize_threshold.load(Ordering::Acquire);

        let table = self.table.load_full();
        let resizing = allow_resize && needs_resize && table.len() < MAXIMUM_SEGMENT_SIZE;
        let mut retained = 0;
        let mut purged = 0;

        if resizing {
            let size = table.len() << 1;
            let mut heads: Vec<Option<Arc<Reference<K, V>>>> = vec![None; size];
            for reference in table.slots.iter().flat_map(|slot| chain(slot.load_full())) {
                if !reference.is_live() {
                    purged += 1;
                    continue;
                }
                let index = reference.hash() as usize & (size - 1);
                let next = heads[index].take();
                heads[index] = Some(manager.create_reference(
                    Arc::clone(reference.entry()),
                    reference.hash(),
                    next,
                ));
                retained += 1;
            }
            self.table.store(Arc::new(Table::from_heads(heads)));
            self.resize_threshold
                .store(threshold(size, self.load_factor), Ordering::Release);
            metrics.record_resize();
            debug!("segment {} resized from {} to {} slots", self.index, table.len(), size);
        } else {
            for slot in table.slots.iter() {
                let head = slot.load_full();
                let live = chain(head.clone()).filter(|r| r.is_live()).count();
                let total = chain(head.clone()).count();
                retained += live;
                if live == total {
                    continue;
                }
                purged += total - live;
                let rebuilt = chain(head)
                    .filter(|reference| reference.is_live())
                    .fold(None, |next, reference| {
                        Some(manager.create_reference(
                            Arc::clone(reference.entry()),
                            reference.hash(),
                            next,
                        ))
                    });
                slot.store(rebuilt);
            }
        }

        self.count.store(retained, Ordering::Release);
        if purged > 0 {
            metrics.record_purge(purged as u64);
        }
        trace!(
            "segment {} restructured: {} purged, {} retained",
            self.index,
            purged,
            retained
        );
    }
}
