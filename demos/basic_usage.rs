//! Basic usage example for snapmap
//!
//! This example walks through the full map API: the single-key lifecycle,
//! conditional updates, iteration, and a shared counter updated from many
//! threads without losing increments.

use snapmap::SnapshotMap;
use std::sync::Arc;
use std::thread;

fn main() {
    println!("snapmap Usage Example");
    println!("=====================");

    // Single-key lifecycle.
    println!("\n1. Store / Load / Delete:");
    let map: SnapshotMap<String, String> = SnapshotMap::new();
    map.store("name".to_string(), "duyuqing".to_string());
    println!("   load(name) = {:?}", map.load(&"name".to_string()));

    let taken = map.load_and_delete(&"name".to_string());
    println!("   load_and_delete(name) = {:?}", taken);
    println!("   load(name) = {:?}", map.load(&"name".to_string()));

    // load_or_store: first caller installs, later callers observe.
    println!("\n2. LoadOrStore:");
    let (value, loaded) = map.load_or_store("name".to_string(), "duyuqing".to_string());
    println!("   first call  -> value={:?}, already present={}", value, loaded);
    let (value, loaded) = map.load_or_store("name".to_string(), "someone-else".to_string());
    println!("   second call -> value={:?}, already present={}", value, loaded);

    // Conditional updates.
    println!("\n3. CompareAndSwap / CompareAndDelete:");
    let swapped = map.compare_and_swap(
        &"name".to_string(),
        &"duyuqing".to_string(),
        "renamed".to_string(),
    );
    println!("   compare_and_swap(duyuqing -> renamed) = {}", swapped);
    let deleted = map.compare_and_delete(&"name".to_string(), &"renamed".to_string());
    println!("   compare_and_delete(renamed) = {}", deleted);

    // Iteration over a weakly consistent snapshot.
    println!("\n4. Range:");
    let scores: SnapshotMap<String, i32> = SnapshotMap::new();
    for i in 0..5 {
        scores.store(format!("player-{}", i), i * 10);
    }
    let mut entries: Vec<(String, i32)> = Vec::new();
    scores.range(|key, value| {
        entries.push((key.clone(), *value));
        true
    });
    entries.sort();
    for (key, value) in &entries {
        println!("   {} = {}", key, value);
    }

    // A shared counter: compare_and_swap retry loops never lose an update.
    println!("\n5. Shared counter across 10 threads:");
    let counter: Arc<SnapshotMap<&str, u64>> = Arc::new(SnapshotMap::new());
    counter.store("count", 0);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..100 {
                    loop {
                        let current = counter.load(&"count").unwrap();
                        if counter.compare_and_swap(&"count", &current, current + 1) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    println!("   final count = {:?} (expected 1000)", counter.load(&"count"));

    println!("\nDone.");
}
