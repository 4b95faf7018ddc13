//! Property-based tests for the snapshot map using proptest
//!
//! These tests drive the map with randomized operation sequences and check it
//! against a plain `HashMap` reference model, plus a few concurrent
//! properties that must hold regardless of interleaving.

use crate::map::SnapshotMap;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

/// One step of a randomized workload. Keys are drawn from a small space so
/// sequences revisit keys and exercise tombstones, revival, and promotion.
#[derive(Debug, Clone)]
enum Op {
    Load(u8),
    Store(u8, u32),
    Swap(u8, u32),
    Delete(u8),
    LoadAndDelete(u8),
    LoadOrStore(u8, u32),
    CompareAndSwap(u8, u32, u32),
    CompareAndDelete(u8, u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 0u8..8;
    let value = 0u32..1000;
    prop_oneof![
        key.clone().prop_map(Op::Load),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::Store(k, v)),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::Swap(k, v)),
        key.clone().prop_map(Op::Delete),
        key.clone().prop_map(Op::LoadAndDelete),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::LoadOrStore(k, v)),
        (key.clone(), value.clone(), value.clone())
            .prop_map(|(k, old, new)| Op::CompareAndSwap(k, old, new)),
        (key, value).prop_map(|(k, v)| Op::CompareAndDelete(k, v)),
    ]
}

proptest! {
    /// Sequentially, every operation must agree with the HashMap model.
    #[test]
    fn test_matches_reference_model(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let map: SnapshotMap<u8, u32> = SnapshotMap::new();
        let mut model: HashMap<u8, u32> = HashMap::new();

        for op in ops {
            match op {
                Op::Load(k) => {
                    prop_assert_eq!(map.load(&k), model.get(&k).copied());
                }
                Op::Store(k, v) => {
                    map.store(k, v);
                    model.insert(k, v);
                }
                Op::Swap(k, v) => {
                    prop_assert_eq!(map.swap(k, v), model.insert(k, v));
                }
                Op::Delete(k) => {
                    map.delete(&k);
                    model.remove(&k);
                }
                Op::LoadAndDelete(k) => {
                    prop_assert_eq!(map.load_and_delete(&k), model.remove(&k));
                }
                Op::LoadOrStore(k, v) => {
                    let expected = match model.get(&k) {
                        Some(&existing) => (existing, true),
                        None => {
                            model.insert(k, v);
                            (v, false)
                        }
                    };
                    prop_assert_eq!(map.load_or_store(k, v), expected);
                }
                Op::CompareAndSwap(k, old, new) => {
                    let expected = model.get(&k) == Some(&old);
                    if expected {
                        model.insert(k, new);
                    }
                    prop_assert_eq!(map.compare_and_swap(&k, &old, new), expected);
                }
                Op::CompareAndDelete(k, old) => {
                    let expected = model.get(&k) == Some(&old);
                    if expected {
                        model.remove(&k);
                    }
                    prop_assert_eq!(map.compare_and_delete(&k, &old), expected);
                }
            }
        }

        // The final contents must match exactly, through load and range.
        for k in 0u8..8 {
            prop_assert_eq!(map.load(&k), model.get(&k).copied());
        }
        let mut ranged: HashMap<u8, u32> = HashMap::new();
        let mut duplicate = false;
        map.range(|k, v| {
            if ranged.insert(*k, *v).is_some() {
                duplicate = true;
            }
            true
        });
        prop_assert!(!duplicate);
        prop_assert_eq!(ranged, model);
    }

    /// Concurrent stores to disjoint keys must all be visible afterwards.
    #[test]
    fn test_concurrent_disjoint_stores(
        num_threads in 2usize..6,
        keys_per_thread in 10usize..50,
    ) {
        let map: Arc<SnapshotMap<usize, usize>> = Arc::new(SnapshotMap::new());
        let mut handles = vec![];

        for thread_id in 0..num_threads {
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                for i in 0..keys_per_thread {
                    let key = thread_id * keys_per_thread + i;
                    map.store(key, key * 2);
                    map.load(&key);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..num_threads * keys_per_thread {
            prop_assert_eq!(map.load(&key), Some(key * 2));
        }

        let mut seen = std::collections::HashSet::new();
        map.range(|k, _| {
            seen.insert(*k);
            true
        });
        prop_assert_eq!(seen.len(), num_threads * keys_per_thread);
    }

    /// Range must never yield a key twice, whatever preceded it.
    #[test]
    fn test_range_yields_unique_keys(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let map: SnapshotMap<u8, u32> = SnapshotMap::new();
        for op in ops {
            match op {
                Op::Load(k) => { map.load(&k); }
                Op::Store(k, v) => map.store(k, v),
                Op::Swap(k, v) => { map.swap(k, v); }
                Op::Delete(k) => map.delete(&k),
                Op::LoadAndDelete(k) => { map.load_and_delete(&k); }
                Op::LoadOrStore(k, v) => { map.load_or_store(k, v); }
                Op::CompareAndSwap(k, old, new) => { map.compare_and_swap(&k, &old, new); }
                Op::CompareAndDelete(k, old) => { map.compare_and_delete(&k, &old); }
            }
        }

        let mut seen = std::collections::HashSet::new();
        let mut duplicate = None;
        map.range(|k, _| {
            if !seen.insert(*k) {
                duplicate = Some(*k);
                return false;
            }
            true
        });
        prop_assert_eq!(duplicate, None);
    }
}
