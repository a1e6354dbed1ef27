//! Keyed, reference-counted cache with TTL and size-based eviction.
//!
//! Entries are handed out as `Arc<CacheEntry>` with a reference count. An
//! entry with a non-zero count is never evicted, expired or cleared; only
//! [`DynamicCache::remove`] unlinks it unconditionally. Values themselves are
//! shared, so a borrower's handle stays valid after the cache drops its slot.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::cache::evictor::{EvictionOrder, Evictor};
use crate::cache::monotonic_millis;
use crate::mem_tracker::MemTracker;

const NEVER_EXPIRE: i64 = i64::MAX;

/// One slot of a [`DynamicCache`].
#[derive(Debug)]
pub struct CacheEntry<K, V> {
    key: K,
    refs: AtomicU32,
    expire_at_ms: AtomicI64,
    ttl_ms: AtomicI64,
    size: AtomicUsize,
    last_access: AtomicU64,
    value: Mutex<V>,
}

impl<K, V> CacheEntry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Lock the value. Populators hold this while loading.
    pub fn value(&self) -> MutexGuard<'_, V> {
        self.value.lock()
    }

    pub fn get_ref(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Object size last reported through [`DynamicCache::update_object_size`].
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn expire_at_ms(&self) -> i64 {
        self.expire_at_ms.load(Ordering::Relaxed)
    }

    /// Set an absolute expiration time (monotonic millis).
    pub fn update_expire_time(&self, expire_at_ms: i64) {
        self.expire_at_ms.store(expire_at_ms, Ordering::Relaxed);
    }

    /// Override the TTL applied when this entry's last reference is released.
    pub fn set_ttl_ms(&self, ttl_ms: i64) {
        self.ttl_ms.store(ttl_ms, Ordering::Relaxed);
    }
}

struct Slots<K, V> {
    map: HashMap<K, Arc<CacheEntry<K, V>>>,
    size: usize,
    capacity: usize,
    tick: u64,
}

/// Keyed, refcounted cache.
pub struct DynamicCache<K, V> {
    name: String,
    slots: Mutex<Slots<K, V>>,
    ttl_ms: i64,
    evictor: Evictor,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl<K, V> DynamicCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Default,
{
    /// Create a cache. `capacity` is in bytes; `usize::MAX` means unbounded.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        ttl_ms: i64,
        order: EvictionOrder,
    ) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                size: 0,
                capacity,
                tick: 0,
            }),
            ttl_ms,
            evictor: Evictor::new(order),
            mem_tracker: None,
        }
    }

    /// Account entry sizes against `tracker`.
    pub fn with_mem_tracker(mut self, tracker: Arc<MemTracker>) -> Self {
        self.mem_tracker = Some(tracker);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mem_tracker(&self) -> Option<&Arc<MemTracker>> {
        self.mem_tracker.as_ref()
    }

    /// Return the entry for `key` with its refcount incremented, inserting an
    /// empty one if absent. The second field is `true` for the caller that
    /// inserted it; that caller is the only one expected to populate it.
    pub fn get_or_create(&self, key: K) -> (Arc<CacheEntry<K, V>>, bool) {
        let mut slots = self.slots.lock();
        slots.tick += 1;
        let tick = slots.tick;
        if let Some(entry) = slots.map.get(&key) {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            entry.last_access.store(tick, Ordering::Relaxed);
            return (Arc::clone(entry), false);
        }
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            refs: AtomicU32::new(1),
            expire_at_ms: AtomicI64::new(NEVER_EXPIRE),
            ttl_ms: AtomicI64::new(self.ttl_ms),
            size: AtomicUsize::new(0),
            last_access: AtomicU64::new(tick),
            value: Mutex::new(V::default()),
        });
        slots.map.insert(key, Arc::clone(&entry));
        (entry, true)
    }

    /// Like [`get_or_create`](Self::get_or_create), returning a guard that
    /// releases the reference when dropped.
    pub fn acquire(&self, key: K) -> CacheGuard<'_, K, V> {
        let (entry, created) = self.get_or_create(key);
        CacheGuard {
            cache: self,
            entry,
            created,
            held: true,
        }
    }

    /// Return the entry for `key` with its refcount incremented, if present.
    pub fn get(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
        let mut slots = self.slots.lock();
        slots.tick += 1;
        let tick = slots.tick;
        slots.map.get(key).map(|entry| {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            entry.last_access.store(tick, Ordering::Relaxed);
            Arc::clone(entry)
        })
    }

    /// Drop one reference. At zero the entry starts its TTL and becomes
    /// evictable; if the cache is over capacity it is shrunk right away.
    pub fn release(&self, entry: &Arc<CacheEntry<K, V>>) {
        let mut slots = self.slots.lock();
        let prev = entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(1)))
            .unwrap_or(0);
        if prev <= 1 {
            let ttl = entry.ttl_ms.load(Ordering::Relaxed);
            entry.update_expire_time(monotonic_millis().saturating_add(ttl));
            if slots.size > slots.capacity {
                let capacity = slots.capacity;
                self.evict_locked(&mut slots, capacity);
            }
        }
    }

    /// Unlink `entry` regardless of its refcount and release its memory.
    /// Returns `false` if the slot no longer holds this entry.
    pub fn remove(&self, entry: &Arc<CacheEntry<K, V>>) -> bool {
        let mut slots = self.slots.lock();
        entry
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(1)))
            .ok();
        let linked = slots
            .map
            .get(entry.key())
            .is_some_and(|cur| Arc::ptr_eq(cur, entry));
        if linked {
            slots.map.remove(entry.key());
            self.unaccount(&mut slots, entry.size());
        }
        linked
    }

    /// Record the entry's real footprint after population.
    pub fn update_object_size(&self, entry: &Arc<CacheEntry<K, V>>, bytes: usize) {
        let mut slots = self.slots.lock();
        let old = entry.size.swap(bytes, Ordering::Relaxed);
        let linked = slots
            .map
            .get(entry.key())
            .is_some_and(|cur| Arc::ptr_eq(cur, entry));
        if !linked {
            return;
        }
        slots.size = slots.size.saturating_sub(old) + bytes;
        if let Some(tracker) = &self.mem_tracker {
            tracker.consume(bytes as i64 - old as i64);
        }
        if slots.size > slots.capacity {
            let capacity = slots.capacity;
            self.evict_locked(&mut slots, capacity);
        }
    }

    /// Remove every unreferenced entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let victims: Vec<K> = slots
            .map
            .values()
            .filter(|e| e.get_ref() == 0)
            .map(|e| e.key.clone())
            .collect();
        self.remove_keys_locked(&mut slots, victims)
    }

    /// Remove unreferenced entries whose expiration has passed.
    pub fn clear_expired(&self) -> usize {
        let now = monotonic_millis();
        let mut slots = self.slots.lock();
        let victims: Vec<K> = slots
            .map
            .values()
            .filter(|e| e.get_ref() == 0 && e.expire_at_ms() <= now)
            .map(|e| e.key.clone())
            .collect();
        self.remove_keys_locked(&mut slots, victims)
    }

    /// Evict unreferenced entries until the total size is `<= target_bytes`.
    /// Returns whether the target was reached.
    pub fn try_evict(&self, target_bytes: usize) -> bool {
        let mut slots = self.slots.lock();
        self.evict_locked(&mut slots, target_bytes);
        slots.size <= target_bytes
    }

    /// Total object size in bytes.
    pub fn size(&self) -> usize {
        self.slots.lock().size
    }

    /// Number of entries.
    pub fn object_size(&self) -> usize {
        self.slots.lock().map.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }

    /// `(key, size)` of every entry, in no particular order.
    pub fn get_entry_sizes(&self) -> Vec<(K, usize)> {
        self.slots
            .lock()
            .map
            .values()
            .map(|e| (e.key.clone(), e.size()))
            .collect()
    }

    fn evict_locked(&self, slots: &mut Slots<K, V>, target: usize) {
        let candidates = slots
            .map
            .values()
            .filter(|e| e.get_ref() == 0)
            .map(|e| (e.key.clone(), e.size(), e.last_access.load(Ordering::Relaxed)));
        let victims = self.evictor.select_victims(candidates, slots.size, target);
        if victims.is_empty() {
            return;
        }
        let before = slots.size;
        let evicted = self.remove_keys_locked(slots, victims);
        debug!(
            cache = %self.name,
            evicted,
            before,
            after = slots.size,
            target,
            "Evicted cache entries"
        );
    }

    fn remove_keys_locked(&self, slots: &mut Slots<K, V>, keys: Vec<K>) -> usize {
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = slots.map.remove(&key) {
                self.unaccount(slots, entry.size());
                removed += 1;
            }
        }
        removed
    }

    fn unaccount(&self, slots: &mut Slots<K, V>, bytes: usize) {
        slots.size = slots.size.saturating_sub(bytes);
        if let Some(tracker) = &self.mem_tracker {
            tracker.release(bytes as i64);
        }
    }
}

/// A held reference to a cache entry, released when dropped.
pub struct CacheGuard<'a, K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Default,
{
    cache: &'a DynamicCache<K, V>,
    entry: Arc<CacheEntry<K, V>>,
    created: bool,
    held: bool,
}

impl<K, V> CacheGuard<'_, K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Default,
{
    /// Whether this guard's caller inserted the entry.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn entry(&self) -> &Arc<CacheEntry<K, V>> {
        &self.entry
    }

    pub fn value(&self) -> MutexGuard<'_, V> {
        self.entry().value()
    }

    pub fn set_object_size(&self, bytes: usize) {
        self.cache.update_object_size(self.entry(), bytes);
    }

    /// Remove the entry from the cache instead of releasing it.
    pub fn discard(mut self) {
        self.held = false;
        self.cache.remove(&self.entry);
    }
}

impl<K, V> Drop for CacheGuard<'_, K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Default,
{
    fn drop(&mut self) {
        if self.held {
            self.cache.release(&self.entry);
        }
    }
}
