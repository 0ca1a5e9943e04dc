//! Loom-based verification of the reclamation handshake
//!
//! These tests use Loom to explore the interleavings of the two protocols the
//! map relies on: a binding reports its reclamation at most once no matter how
//! many parties race to report it, and segment counters stay consistent when
//! additions race with purge passes under the segment lock.

use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use loom::sync::{Arc, Mutex};
use loom::thread;

/// Simplified tracker: a done flag guarding a push onto a shared queue
struct LoomTracker {
    id: usize,
    done: AtomicBool,
    queue: Arc<Mutex<Vec<usize>>>,
}

impl LoomTracker {
    fn new(id: usize, queue: Arc<Mutex<Vec<usize>>>) -> Self {
        Self {
            id,
            done: AtomicBool::new(false),
            queue,
        }
    }

    fn enqueue(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.lock().unwrap().push(self.id);
    }

    fn detach(&self) {
        self.done.store(true, Ordering::Release);
    }
}

/// Simplified segment: a chain of (id, live) nodes and a counter that is
/// only written under the lock
struct LoomSegment {
    chain: Mutex<Vec<(usize, Arc<AtomicBool>)>>,
    count: AtomicUsize,
}

impl LoomSegment {
    fn new() -> Self {
        Self {
            chain: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    fn add(&self, id: usize, live: Arc<AtomicBool>) {
        let mut chain = self.chain.lock().unwrap();
        chain.push((id, live));
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn purge(&self) {
        let mut chain = self.chain.lock().unwrap();
        chain.retain(|(_, live)| live.load(Ordering::Acquire));
        self.count.store(chain.len(), Ordering::Release);
    }
}

/// A value drop and an explicit release racing to report one binding
#[test]
fn loom_test_reclamation_reported_once() {
    loom::model(|| {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let tracker = Arc::new(LoomTracker::new(7, Arc::clone(&queue)));

        let dropper = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.enqueue())
        };
        let releaser = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.enqueue())
        };
        dropper.join().unwrap();
        releaser.join().unwrap();

        assert_eq!(*queue.lock().unwrap(), vec![7]);
    });
}

/// A binding replaced before its old value dies never reports
#[test]
fn loom_test_detached_binding_never_reports() {
    loom::model(|| {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let old = Arc::new(LoomTracker::new(1, Arc::clone(&queue)));
        let new = Arc::new(LoomTracker::new(2, Arc::clone(&queue)));

        // The rebind detaches under the lock before the old value can drop
        old.detach();
        let dropper = {
            let old = Arc::clone(&old);
            thread::spawn(move || old.enqueue())
        };
        let releaser = {
            let new = Arc::clone(&new);
            thread::spawn(move || new.enqueue())
        };
        dropper.join().unwrap();
        releaser.join().unwrap();

        assert_eq!(*queue.lock().unwrap(), vec![2]);
    });
}

/// Additions racing with a purge leave the counter equal to the live chain
#[test]
fn loom_test_count_matches_chain_after_purge() {
    loom::model(|| {
        let segment = Arc::new(LoomSegment::new());
        let first_live = Arc::new(AtomicBool::new(true));
        segment.add(0, Arc::clone(&first_live));

        let writer = {
            let segment = Arc::clone(&segment);
            thread::spawn(move || segment.add(1, Arc::new(AtomicBool::new(true))))
        };
        let reclaimer = {
            let segment = Arc::clone(&segment);
            let first_live = Arc::clone(&first_live);
            thread::spawn(move || {
                first_live.store(false, Ordering::Release);
                segment.purge();
            })
        };
        writer.join().unwrap();
        reclaimer.join().unwrap();

        let chain_len = segment.chain.lock().unwrap().len();
        assert_eq!(segment.count.load(Ordering::Acquire), chain_len);
        assert_eq!(chain_len, 1);
    });
}
