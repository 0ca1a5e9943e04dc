//! Reclaimable references
//!
//! Every mapping lives in an [`Entry`] that is wrapped by a [`Reference`] node
//! in a segment's collision chain. Values are handed out as [`Tracked`]
//! handles; when the last handle to a value is dropped, each entry bound to
//! that value is notified through its [`Tracker`], which pushes itself onto the
//! owning segment's reclamation queue exactly once. Segments drain those
//! queues during restructuring and purge the dead nodes from their chains.
//!
//! Chains are immutable once published: `next` never changes, so readers can
//! walk a chain without locking while a writer rebuilds it.

use super::config::ReferenceKind;
use arc_swap::ArcSwap;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

struct TrackedInner<V> {
    value: V,
    // Trackers of every entry currently bound to this value
    watchers: Mutex<Vec<Weak<Tracker>>>,
    // Soft bindings currently holding a strong handle to this value
    soft_holders: AtomicUsize,
}

impl<V> Drop for TrackedInner<V> {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            if let Some(tracker) = watcher.upgrade() {
                tracker.enqueue();
            }
        }
    }
}

/// A strong, cloneable handle to a value stored in a map
///
/// Holding a `Tracked<V>` keeps the value reachable. Once every handle is
/// dropped, entries bound to the value become eligible for purging (for
/// [`ReferenceKind::Weak`] maps immediately, for [`ReferenceKind::Soft`] maps
/// after a memory-pressure pass).
///
/// # Examples
///
/// ```rust
/// use reclaim_map::Tracked;
///
/// let value = Tracked::new(String::from("pattern"));
/// let other = value.clone();
/// assert!(Tracked::ptr_eq(&value, &other));
/// assert_eq!(value.len(), 7);
/// ```
pub struct Tracked<V> {
    inner: Arc<TrackedInner<V>>,
}

impl<V> Tracked<V> {
    /// Wrap a value so a map can track its reachability
    pub fn new(value: V) -> Self {
        Self {
            inner: Arc::new(TrackedInner {
                value,
                watchers: Mutex::new(Vec::new()),
                soft_holders: AtomicUsize::new(0),
            }),
        }
    }

    /// Whether both handles point at the same value
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    /// Number of strong handles (including ones held by soft map entries)
    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    fn downgrade(this: &Self) -> Weak<TrackedInner<V>> {
        Arc::downgrade(&this.inner)
    }

    fn watch(&self, tracker: &Arc<Tracker>) {
        let mut watchers = self.inner.watchers.lock();
        watchers.retain(|watcher| watcher.upgrade().is_some_and(|t| !t.is_done()));
        watchers.push(Arc::downgrade(tracker));
    }
}

impl<V> Clone for Tracked<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Deref for Tracked<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner.value
    }
}

impl<V> From<V> for Tracked<V> {
    fn from(value: V) -> Self {
        Self::new(value)
    }
}

impl<V: PartialEq> PartialEq for Tracked<V> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<V: Eq> Eq for Tracked<V> {}

impl<V: fmt::Debug> fmt::Debug for Tracked<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<V: fmt::Display> fmt::Display for Tracked<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

/// Per-segment queues of reclaimed bindings
pub(crate) struct ReclaimQueue {
    segments: Box<[SegQueue<Arc<Tracker>>]>,
}

impl ReclaimQueue {
    fn new(segment_count: usize) -> Self {
        Self {
            segments: (0..segment_count).map(|_| SegQueue::new()).collect(),
        }
    }
}

/// Reclamation signal for one value binding of one entry
///
/// A tracker is enqueued at most once, either by the death of its value or by
/// an explicit release. Trackers of replaced bindings are detached so they
/// never report.
pub(crate) struct Tracker {
    segment: usize,
    done: AtomicBool,
    queue: Weak<ReclaimQueue>,
}

impl Tracker {
    fn new(segment: usize, queue: Weak<ReclaimQueue>) -> Self {
        Self {
            segment,
            done: AtomicBool::new(false),
            queue,
        }
    }

    fn sibling(&self) -> Arc<Tracker> {
        Arc::new(Self::new(self.segment, self.queue.clone()))
    }

    fn enqueue(self: &Arc<Self>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.segments[self.segment].push(Arc::clone(self));
        }
    }

    fn detach(&self) {
        self.done.store(true, Ordering::Release);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// The strong handle a soft binding keeps to its value
struct SoftHandle<V> {
    value: Tracked<V>,
}

impl<V> SoftHandle<V> {
    fn new(value: Tracked<V>) -> Self {
        value.inner.soft_holders.fetch_add(1, Ordering::AcqRel);
        Self { value }
    }

    /// Whether every strong handle to the value belongs to a soft binding
    fn is_held_only_softly(&self) -> bool {
        // Holders rise after and fall before the strong count, so reading
        // them first can only under-report.
        let holders = self.value.inner.soft_holders.load(Ordering::Acquire);
        Tracked::strong_count(&self.value) <= holders
    }
}

impl<V> Drop for SoftHandle<V> {
    fn drop(&mut self) {
        self.value.inner.soft_holders.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One value binding of an entry, swapped out whole on rebind or softening
pub(crate) struct Binding<V> {
    weak: Weak<TrackedInner<V>>,
    // Present only for soft entries
    strong: Option<SoftHandle<V>>,
    tracker: Arc<Tracker>,
}

impl<V> Binding<V> {
    fn new(value: Tracked<V>, kind: ReferenceKind, tracker: Arc<Tracker>) -> Self {
        value.watch(&tracker);
        let weak = Tracked::downgrade(&value);
        let strong = match kind {
            ReferenceKind::Soft => Some(SoftHandle::new(value)),
            ReferenceKind::Weak => None,
        };
        Self {
            weak,
            strong,
            tracker,
        }
    }

    fn value(&self) -> Option<Tracked<V>> {
        match &self.strong {
            Some(strong) => Some(strong.value.clone()),
            None => self.weak.upgrade().map(|inner| Tracked { inner }),
        }
    }

    fn is_live(&self) -> bool {
        self.strong.is_some() || self.weak.strong_count() > 0
    }
}

/// An immutable key paired with a replaceable value binding
pub(crate) struct Entry<K, V> {
    key: K,
    binding: ArcSwap<Binding<V>>,
    released: AtomicBool,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    fn is_live(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.binding.load().is_live()
    }

    fn detach(&self) {
        self.binding.load().tracker.detach();
    }

    /// Drop the map's strong handle if only soft bindings hold the value
    ///
    /// The replaced binding is returned so the caller can drop it, and with
    /// it the strong handle, outside the lock. Until then it still counts as
    /// a soft holder, so other entries bound to the same value soften in the
    /// same pass.
    pub(crate) fn soften(&self) -> Option<Arc<Binding<V>>> {
        let binding = self.binding.load_full();
        if !binding.strong.as_ref()?.is_held_only_softly() {
            return None;
        }
        let softened = Arc::new(Binding {
            weak: binding.weak.clone(),
            strong: None,
            tracker: Arc::clone(&binding.tracker),
        });
        Some(self.binding.swap(softened))
    }
}

/// A live entry together with a strong snapshot of its value
///
/// Yielded by map iteration; holding it keeps the value reachable.
pub struct EntryRef<K, V> {
    entry: Arc<Entry<K, V>>,
    value: Tracked<V>,
}

impl<K, V> EntryRef<K, V> {
    /// The entry's key
    pub fn key(&self) -> &K {
        self.entry.key()
    }

    /// The entry's value at the time it was visited
    pub fn value(&self) -> &Tracked<V> {
        &self.value
    }

    /// Take the value handle
    pub fn into_value(self) -> Tracked<V> {
        self.value
    }

    pub(crate) fn entry(&self) -> &Arc<Entry<K, V>> {
        &self.entry
    }
}

impl<K, V> Clone for EntryRef<K, V> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            value: self.value.clone(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for EntryRef<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", self.key())
            .field("value", &*self.value)
            .finish()
    }
}

/// A node in a segment's collision chain
pub(crate) struct Reference<K, V> {
    hash: u32,
    entry: Arc<Entry<K, V>>,
    next: Option<Arc<Reference<K, V>>>,
}

impl<K, V> Reference<K, V> {
    /// The entry, or `None` once reclaimed
    pub(crate) fn get(&self) -> Option<EntryRef<K, V>> {
        if self.entry.released.load(Ordering::Acquire) {
            return None;
        }
        let value = self.entry.binding.load().value()?;
        Some(EntryRef {
            entry: Arc::clone(&self.entry),
            value,
        })
    }

    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }

    pub(crate) fn next(&self) -> Option<&Arc<Reference<K, V>>> {
        self.next.as_ref()
    }

    pub(crate) fn key(&self) -> &K {
        self.entry.key()
    }

    pub(crate) fn entry(&self) -> &Arc<Entry<K, V>> {
        &self.entry
    }

    pub(crate) fn is_live(&self) -> bool {
        self.entry.is_live()
    }

    /// Force the reclaimed state and queue the node for purging
    pub(crate) fn release(&self) {
        if !self.entry.released.swap(true, Ordering::AcqRel) {
            self.entry.binding.load().tracker.enqueue();
        }
    }

    /// Stop reporting reclamation for this node; used when a table is
    /// discarded wholesale
    pub(crate) fn detach(&self) {
        self.entry.detach();
    }
}

/// Creates references at the configured aggressiveness and hands out
/// reclaimed bindings for purging
pub(crate) struct ReferenceManager {
    kind: ReferenceKind,
    queue: Arc<ReclaimQueue>,
}

impl ReferenceManager {
    pub(crate) fn new(kind: ReferenceKind, segment_count: usize) -> Self {
        Self {
            kind,
            queue: Arc::new(ReclaimQueue::new(segment_count)),
        }
    }

    pub(crate) fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub(crate) fn new_entry<K, V>(&self, segment: usize, key: K, value: Tracked<V>) -> Arc<Entry<K, V>> {
        let tracker = Arc::new(Tracker::new(segment, Arc::downgrade(&self.queue)));
        Arc::new(Entry {
            key,
            binding: ArcSwap::from_pointee(Binding::new(value, self.kind, tracker)),
            released: AtomicBool::new(false),
        })
    }

    pub(crate) fn create_reference<K, V>(
        &self,
        entry: Arc<Entry<K, V>>,
        hash: u32,
        next: Option<Arc<Reference<K, V>>>,
    ) -> Arc<Reference<K, V>> {
        Arc::new(Reference { hash, entry, next })
    }

    /// Rebind an entry to a new value in place. Must be called under the
    /// owning segment's lock.
    pub(crate) fn set_value<K, V>(&self, entry: &Entry<K, V>, value: Tracked<V>) {
        let tracker = entry.binding.load().tracker.sibling();
        let previous = entry
            .binding
            .swap(Arc::new(Binding::new(value, self.kind, tracker)));
        previous.tracker.detach();
    }

    /// Next reclaimed binding of `segment`; never blocks and returns each
    /// binding at most once
    pub(crate) fn poll_for_purge(&self, segment: usize) -> Option<Arc<Tracker>> {
        self.queue.segments[segment].pop()
    }
}
