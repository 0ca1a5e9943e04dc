//! Property-based tests for the concurrent reference map using proptest
//!
//! Single-threaded operation sequences are replayed against a
//! `std::collections::HashMap` model; with no concurrent writers and soft
//! references the map must agree with the model exactly, including `len`.

use super::*;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u16),
    PutIfAbsent(u8, u16),
    Remove(u8),
    RemoveIf(u8, u16),
    Replace(u8, u16),
    ReplaceIf(u8, u16, u16),
    Get(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Small key space so operations collide
    let key = 0u8..24;
    let value = 0u16..8;
    prop_oneof![
        3 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
        2 => key.clone().prop_map(Op::Remove),
        1 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::RemoveIf(k, v)),
        1 => (key.clone(), value.clone()).prop_map(|(k, v)| Op::Replace(k, v)),
        1 => (key.clone(), value.clone(), value.clone()).prop_map(|(k, a, b)| Op::ReplaceIf(k, a, b)),
        2 => key.prop_map(Op::Get),
    ]
}

fn unwrap_value(value: Option<Tracked<u16>>) -> Option<u16> {
    value.map(|v| *v)
}

proptest! {
    #[test]
    fn test_matches_hash_map_model(
        initial_capacity in 0usize..64,
        concurrency_level in 1usize..32,
        ops in prop::collection::vec(op_strategy(), 1..200)
    ) {
        let map: ConcurrentReferenceHashMap<u8, u16> = Builder::new()
            .initial_capacity(initial_capacity)
            .concurrency_level(concurrency_level)
            .build()
            .unwrap();
        let mut model: HashMap<u8, u16> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    prop_assert_eq!(unwrap_value(map.put(k, v)), model.insert(k, v));
                }
                Op::PutIfAbsent(k, v) => {
                    let expected = model.get(&k).copied();
                    model.entry(k).or_insert(v);
                    prop_assert_eq!(unwrap_value(map.put_if_absent(k, v)), expected);
                }
                Op::Remove(k) => {
                    prop_assert_eq!(unwrap_value(map.remove(&k)), model.remove(&k));
                }
                Op::RemoveIf(k, v) => {
                    let expected = model.get(&k) == Some(&v);
                    if expected {
                        model.remove(&k);
                    }
                    prop_assert_eq!(map.remove_if(&k, &v), expected);
                }
                Op::Replace(k, v) => {
                    let expected = model.get_mut(&k).map(|slot| std::mem::replace(slot, v));
                    prop_assert_eq!(unwrap_value(map.replace(&k, v)), expected);
                }
                Op::ReplaceIf(k, old, new) => {
                    let expected = model.get(&k) == Some(&old);
                    if expected {
                        model.insert(k, new);
                    }
                    prop_assert_eq!(map.replace_if(&k, &old, new), expected);
                }
                Op::Get(k) => {
                    prop_assert_eq!(unwrap_value(map.get(&k)), model.get(&k).copied());
                }
            }
            prop_assert_eq!(map.len(), model.len());
        }

        let mut entries: Vec<(u8, u16)> = map.iter().map(|e| (*e.key(), **e.value())).collect();
        entries.sort_unstable();
        let mut expected: Vec<(u8, u16)> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(entries, expected);
    }

    #[test]
    fn test_segment_count_is_power_of_two(concurrency_level in 1usize..5000) {
        let map: ConcurrentReferenceHashMap<u8, u8> = Builder::new()
            .initial_capacity(0)
            .concurrency_level(concurrency_level)
            .build()
            .unwrap();
        let segments = map.segment_count();
        prop_assert!(segments.is_power_of_two());
        prop_assert!(segments >= concurrency_level);
        prop_assert!(segments < concurrency_level * 2);
    }

    #[test]
    fn test_weak_entries_vanish_with_their_handles(
        kept in prop::collection::vec(any::<bool>(), 1..64)
    ) {
        let map: ConcurrentReferenceHashMap<usize, usize> =
            ConcurrentReferenceHashMap::with_kind(ReferenceKind::Weak);
        let mut handles = Vec::new();
        for (i, &keep) in kept.iter().enumerate() {
            let value = Tracked::new(i);
            map.put(i, value.clone());
            if keep {
                handles.push(value);
            }
        }
        map.purge_unreferenced_entries();

        let expected = kept.iter().filter(|&&keep| keep).count();
        prop_assert_eq!(map.len(), expected);
        for (i, &keep) in kept.iter().enumerate() {
            prop_assert_eq!(map.contains_key(&i), keep);
        }
    }
}
