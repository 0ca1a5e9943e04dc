//! Tests for the concurrent reference map

use super::*;
use crate::metrics::MetricsCollector;
use std::sync::{Arc, Barrier};
use std::thread;

fn soft_map(concurrency_level: usize) -> ConcurrentReferenceHashMap<String, String> {
    Builder::new()
        .initial_capacity(16)
        .load_factor(0.75)
        .concurrency_level(concurrency_level)
        .reference_kind(ReferenceKind::Soft)
        .build()
        .unwrap()
}

#[test]
fn test_put_get_overwrite() {
    let map = soft_map(4);
    assert!(map.put("a".to_string(), "1".to_string()).is_none());
    assert_eq!(map.get("a").as_deref().map(String::as_str), Some("1"));

    let previous = map.put("a".to_string(), "2".to_string());
    assert_eq!(previous.as_deref().map(String::as_str), Some("1"));
    assert_eq!(map.get("a").as_deref().map(String::as_str), Some("2"));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_put_if_absent_keeps_existing() {
    let map = soft_map(4);
    assert!(map.put_if_absent("a".to_string(), "1".to_string()).is_none());
    let existing = map.put_if_absent("a".to_string(), "2".to_string());
    assert_eq!(existing.as_deref().map(String::as_str), Some("1"));
    assert_eq!(map.get("a").as_deref().map(String::as_str), Some("1"));
}

#[test]
fn test_remove_and_remove_if() {
    let map = soft_map(4);
    map.put("a".to_string(), "1".to_string());
    map.put("b".to_string(), "2".to_string());

    assert!(!map.remove_if("a", &"9".to_string()));
    assert!(map.remove_if("a", &"1".to_string()));
    assert!(map.get("a").is_none());

    assert_eq!(map.remove("b").as_deref().map(String::as_str), Some("2"));
    assert!(map.remove("b").is_none());
    assert!(map.remove("missing").is_none());
    assert_eq!(map.len(), 0);
}

#[test]
fn test_replace_only_existing() {
    let map = soft_map(4);
    assert!(map.replace("a", "1".to_string()).is_none());
    assert!(map.get("a").is_none());

    map.put("a".to_string(), "1".to_string());
    let previous = map.replace("a", "2".to_string());
    assert_eq!(previous.as_deref().map(String::as_str), Some("1"));

    assert!(!map.replace_if("a", &"1".to_string(), "3".to_string()));
    assert!(map.replace_if("a", &"2".to_string(), "3".to_string()));
    assert_eq!(map.get("a").as_deref().map(String::as_str), Some("3"));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_none_keys_and_values_are_ordinary() {
    let map: ConcurrentReferenceHashMap<Option<u32>, Option<u32>> = ConcurrentReferenceHashMap::new();
    map.put(None, Some(1));
    map.put(Some(1), None);

    assert_eq!(map.get(&None).map(|v| *v), Some(Some(1)));
    // A mapping to None is distinct from no mapping
    assert_eq!(map.get(&Some(1)).map(|v| *v), Some(None));
    assert!(map.get(&Some(2)).is_none());
    assert!(map.contains_key(&Some(1)));
    assert_eq!(map.len(), 2);

    assert_eq!(map.remove(&None).map(|v| *v), Some(Some(1)));
    assert!(!map.contains_key(&None));
}

#[test]
fn test_hundred_keys_across_four_segments() {
    let map = soft_map(4);
    for i in 0..100 {
        map.put(format!("k{i}"), format!("v{i}"));
    }
    assert_eq!(map.segment_count(), 4);
    assert_eq!(map.len(), 100);
    assert_eq!(map.get("k37").as_deref().map(String::as_str), Some("v37"));

    assert_eq!(map.remove("k50").as_deref().map(String::as_str), Some("v50"));
    assert_eq!(map.len(), 99);
    assert!(map.get("k50").is_none());
    assert!(map.segments.iter().any(|s| s.table().len() > 4));
}

#[test]
fn test_concurrent_disjoint_inserts() {
    let map: Arc<ConcurrentReferenceHashMap<u64, u64>> = Arc::new(
        Builder::new()
            .initial_capacity(16)
            .concurrency_level(4)
            .build()
            .unwrap(),
    );
    let num_threads = 8;
    let operations_per_thread = 1000;
    let barrier = Arc::new(Barrier::new(num_threads as usize));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..operations_per_thread {
                    let key = thread_id * operations_per_thread + i;
                    map.put(key, key * 2);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 8000);
    for key in 0..8000u64 {
        assert_eq!(map.get(&key).map(|v| *v), Some(key * 2));
    }
}

#[test]
fn test_same_key_writers_serialize() {
    let map: Arc<ConcurrentReferenceHashMap<u32, u32>> = Arc::new(ConcurrentReferenceHashMap::new());
    let handles: Vec<_> = (0..4u32)
        .map(|thread_id| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..500 {
                    map.put(0, thread_id * 1000 + i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(map.len(), 1);
    let last = *map.get(&0).unwrap();
    assert_eq!(last % 1000, 499);
}

#[test]
fn test_weak_entries_reclaimed_after_last_handle() {
    let map: ConcurrentReferenceHashMap<u32, String> =
        ConcurrentReferenceHashMap::with_kind(ReferenceKind::Weak);
    let handles: Vec<Tracked<String>> = (0..50).map(|i| Tracked::new(format!("value {i}"))).collect();
    for (i, value) in handles.iter().enumerate() {
        map.put(i as u32, value.clone());
    }
    assert_eq!(map.len(), 50);
    assert_eq!(map.iter().count(), 50);

    drop(handles);
    assert!(map.get(&7).is_none());
    assert_eq!(map.iter().count(), 0);

    map.purge_unreferenced_entries();
    assert_eq!(map.len(), 0);
    assert!(map.metrics().purged >= 50);
}

#[test]
fn test_soft_entries_survive_until_pressure() {
    let map: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::new();
    let held = Tracked::new(1);
    map.put(1, held.clone());
    map.put(2, 2);
    map.put(3, 3);

    map.purge_unreferenced_entries();
    assert_eq!(map.len(), 3);

    assert_eq!(map.relieve_memory_pressure(), 2);
    assert_eq!(map.len(), 1);
    assert!(Tracked::ptr_eq(&map.get(&1).unwrap(), &held));
    assert!(map.get(&2).is_none());

    drop(held);
    assert_eq!(map.relieve_memory_pressure(), 1);
    assert!(map.is_empty());
}

#[test]
fn test_pressure_clears_value_shared_by_several_keys() {
    let map: ConcurrentReferenceHashMap<&str, Vec<u8>> = ConcurrentReferenceHashMap::new();
    let shared = Tracked::new(vec![7u8; 8]);
    map.put("a", shared.clone());
    map.put("b", shared.clone());
    map.put("c", vec![1u8]);

    let held = shared.clone();
    drop(shared);
    assert_eq!(map.relieve_memory_pressure(), 1);
    assert_eq!(map.len(), 2);

    drop(held);
    assert_eq!(map.relieve_memory_pressure(), 2);
    assert_eq!(map.len(), 0);
    assert!(map.get("a").is_none());
    assert!(map.get("b").is_none());
}

#[test]
fn test_weak_map_has_nothing_to_relieve() {
    let map: ConcurrentReferenceHashMap<u32, u32> =
        ConcurrentReferenceHashMap::with_kind(ReferenceKind::Weak);
    let held = Tracked::new(1);
    map.put(1, held.clone());
    assert_eq!(map.relieve_memory_pressure(), 0);
    assert_eq!(map.get(&1).map(|v| *v), Some(1));
}

#[test]
fn test_rebinding_does_not_reclaim_new_value() {
    let map: ConcurrentReferenceHashMap<&str, u32> =
        ConcurrentReferenceHashMap::with_kind(ReferenceKind::Weak);
    let first = Tracked::new(1);
    let second = Tracked::new(2);
    map.put("k", first.clone());
    map.put("k", second.clone());

    drop(first);
    map.purge_unreferenced_entries();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get("k").map(|v| *v), Some(2));

    drop(second);
    map.purge_unreferenced_entries();
    assert_eq!(map.len(), 0);
}

#[test]
fn test_compute_if_absent_racers_share_one_value() {
    let map: Arc<ConcurrentReferenceHashMap<String, usize>> = Arc::new(ConcurrentReferenceHashMap::new());
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let map = Arc::clone(&map);
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                map.compute_if_absent("HH:mm:ss".to_string(), |pattern| {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    pattern.len()
                })
            })
        })
        .collect();
    let values: Vec<Tracked<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    assert!(values.iter().all(|v| Tracked::ptr_eq(v, &values[0])));
    assert_eq!(*values[0], 8);
    assert_eq!(map.len(), 1);

    let before = calls.load(std::sync::atomic::Ordering::SeqCst);
    let cached = map.compute_if_absent("HH:mm:ss".to_string(), |_| unreachable!());
    assert!(Tracked::ptr_eq(&cached, &values[0]));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), before);
}

#[test]
fn test_compute_if_absent_may_use_the_map() {
    let map: ConcurrentReferenceHashMap<u32, u32> = Builder::new()
        .concurrency_level(1)
        .build()
        .unwrap();

    let value = map.compute_if_absent(1, |_| *map.compute_if_absent(2, |_| 2) + 1);
    assert_eq!(*value, 3);
    assert_eq!(map.get(&2).map(|v| *v), Some(2));

    // The computed value loses to an insertion made while it was computed
    let winner = map.compute_if_absent(3, |_| {
        map.put(3, 30);
        0
    });
    assert_eq!(*winner, 30);
    assert_eq!(map.get(&3).map(|v| *v), Some(30));
    assert_eq!(map.len(), 3);
}

#[test]
fn test_get_or_default() {
    let map: ConcurrentReferenceHashMap<&str, u32> = ConcurrentReferenceHashMap::new();
    map.put("a", 1);
    assert_eq!(*map.get_or_default("a", 9), 1);
    assert_eq!(*map.get_or_default("b", 9), 9);
    assert!(!map.contains_key("b"));
}

#[test]
fn test_clear_empties_every_segment() {
    let map = soft_map(8);
    for i in 0..64 {
        map.put(i.to_string(), i.to_string());
    }
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.iter().count(), 0);
    assert!(map.get("3").is_none());

    map.put("again".to_string(), "yes".to_string());
    assert_eq!(map.len(), 1);
}

#[test]
fn test_iteration_survives_concurrent_mutation() {
    let map: Arc<ConcurrentReferenceHashMap<u32, u32>> = Arc::new(
        Builder::new()
            .initial_capacity(4)
            .concurrency_level(2)
            .build()
            .unwrap(),
    );
    for i in 0..100 {
        map.put(i, i);
    }

    let writer = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 100..2000 {
                map.put(i, i);
                if i % 3 == 0 {
                    map.remove(&(i - 100));
                }
            }
        })
    };

    for _ in 0..20 {
        for entry in map.iter() {
            assert_eq!(*entry.key(), **entry.value());
        }
    }
    writer.join().unwrap();

    let count = map.iter().count();
    assert_eq!(count, map.len());
}

#[test]
fn test_metrics_track_hits_and_resizes() {
    let map: ConcurrentReferenceHashMap<u32, u32> = Builder::new()
        .initial_capacity(2)
        .concurrency_level(1)
        .build()
        .unwrap();
    for i in 0..32 {
        map.put(i, i);
    }
    map.get(&1);
    map.get(&100);
    map.remove(&1);

    let metrics = map.metrics();
    assert_eq!(metrics.insertions, 32);
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.removals, 1);
    assert_eq!(metrics.purged, 1);
    assert!(metrics.resizes >= 4);

    map.reset_metrics();
    map.set_metrics_enabled(false);
    map.get(&2);
    assert!(!map.is_metrics_enabled());
    assert_eq!(map.metrics().hits, 0);
}

#[test]
fn test_debug_output() {
    let map: ConcurrentReferenceHashMap<u32, u32> = ConcurrentReferenceHashMap::new();
    map.put(1, 1);
    let debug = format!("{map:?}");
    assert!(debug.contains("segments: 16"));
    assert!(debug.contains("len: 1"));
}
