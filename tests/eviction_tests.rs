//! Integration tests for the eviction policy and the refcounted cache.

use std::sync::Arc;

use pk_update_cache::cache::dynamic::DynamicCache;
use pk_update_cache::cache::evictor::{EvictionOrder, Evictor, Watermarks};
use pk_update_cache::mem_tracker::MemTracker;

type Cache = DynamicCache<i64, Option<Vec<u8>>>;

fn populate(cache: &Cache, key: i64, bytes: usize) {
    let guard = cache.acquire(key);
    *guard.value() = Some(vec![0u8; bytes]);
    guard.set_object_size(bytes);
}

#[test]
fn test_largest_first_sheds_biggest_consumers() {
    let cache = Cache::new("index", usize::MAX, 0, EvictionOrder::LargestFirst);
    for (key, bytes) in [(1, 10), (2, 500), (3, 40), (4, 300)] {
        populate(&cache, key, bytes);
    }
    assert!(cache.try_evict(100));
    let mut left: Vec<i64> = cache.get_entry_sizes().into_iter().map(|(k, _)| k).collect();
    left.sort();
    assert_eq!(left, vec![1, 3]);
}

#[test]
fn test_lru_keeps_recently_used() {
    let cache = Cache::new("state", usize::MAX, 0, EvictionOrder::LeastRecentlyUsed);
    for key in 1..=4 {
        populate(&cache, key, 10);
    }
    // Touch 1 so 2 becomes the oldest.
    let entry = cache.get(&1).unwrap();
    cache.release(&entry);

    assert!(cache.try_evict(20));
    let mut left: Vec<i64> = cache.get_entry_sizes().into_iter().map(|(k, _)| k).collect();
    left.sort();
    assert_eq!(left, vec![1, 4]);
}

#[test]
fn test_eviction_converges_across_calls() {
    let wm = Watermarks::new(10_000, 85, 75);
    let cache = Cache::new("index", usize::MAX, 0, EvictionOrder::LargestFirst);
    for key in 0..100 {
        populate(&cache, key, 100);
    }
    assert_eq!(cache.size(), 10_000);

    if let Some(target) = wm.urgent_target(cache.size() as i64) {
        cache.try_evict(target as usize);
    }
    assert_eq!(cache.size(), 8_500);

    let mut rounds = 0;
    while let Some(target) = wm.high_target(cache.size() as i64, 90) {
        cache.try_evict(target as usize);
        rounds += 1;
        assert!(rounds < 10, "eviction did not converge");
    }
    assert!(cache.size() <= 7_500);
    // 8500 -> 7600 -> 7500: damped, not one jump.
    assert_eq!(rounds, 2);
}

#[test]
fn test_referenced_entries_are_never_evicted() {
    let tracker = MemTracker::root("index", -1);
    let cache = Cache::new("index", usize::MAX, 0, EvictionOrder::LargestFirst)
        .with_mem_tracker(Arc::clone(&tracker));
    populate(&cache, 1, 1000);
    populate(&cache, 2, 10);

    let held = cache.get(&1).unwrap();
    assert!(!cache.try_evict(0));
    assert_eq!(cache.clear(), 0);
    assert_eq!(cache.size(), 1000);
    assert_eq!(tracker.consumption(), 1000);
    assert_eq!(held.value().as_ref().map(Vec::len), Some(1000));

    cache.release(&held);
    assert!(cache.try_evict(0));
    assert_eq!(tracker.consumption(), 0);
}

#[test]
fn test_single_populator_under_contention() {
    let cache = Arc::new(Cache::new("state", usize::MAX, 0, EvictionOrder::LeastRecentlyUsed));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let (entry, created) = cache.get_or_create(42);
                if created {
                    *entry.value() = Some(vec![1; 64]);
                    cache.update_object_size(&entry, 64);
                }
                cache.release(&entry);
                created
            })
        })
        .collect();
    let populators = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|created| *created)
        .count();
    assert_eq!(populators, 1);
    assert_eq!(cache.size(), 64);
}

#[test]
fn test_select_victims_without_enough_candidates() {
    let evictor = Evictor::new(EvictionOrder::LargestFirst);
    let victims = evictor.select_victims([(1, 10, 0), (2, 20, 0)].into_iter(), 1_000, 0);
    assert_eq!(victims, vec![2, 1]);
}
