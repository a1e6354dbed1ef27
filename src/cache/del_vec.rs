//! Per-segment delete vector cache.
//!
//! Maps a segment to the newest delete vector known for it. Versions in a
//! slot only move forward: a normal publish of an older or equal version is
//! rejected, and a store load only replaces a slot with something newer.
//! Explicit invalidation is the only way to drop a slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Result, UpdateError};
use crate::mem_tracker::MemTracker;
use crate::store::MetaStore;
use crate::types::{DelVectorPtr, TabletId, TabletSegmentId};

pub struct DelVecCache {
    entries: Mutex<BTreeMap<TabletSegmentId, DelVectorPtr>>,
    mem_tracker: Arc<MemTracker>,
}

impl DelVecCache {
    pub fn new(mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            mem_tracker,
        }
    }

    /// Delete vector usable by a read at `version`.
    ///
    /// A slot only ever holds the newest vector known for the segment, so a
    /// cached vector is returned as is whatever `version` asks for; it may be
    /// newer than requested. On a miss the vector is loaded from `store` and
    /// cached only if it is the latest version the store has.
    pub fn get_del_vec(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<DelVectorPtr> {
        {
            let entries = self.entries.lock();
            if let Some(cached) = entries.get(&tsid) {
                debug!(
                    %tsid,
                    version,
                    actual_version = cached.version(),
                    "get_del_vec cached"
                );
                return Ok(Arc::clone(cached));
            }
        }

        let (delvec, latest_version) = store.get_del_vector(tsid, version)?;
        let delvec = Arc::new(delvec);
        if delvec.version() == latest_version {
            let mut entries = self.entries.lock();
            let cached = entries.get(&tsid).map(|c| (c.version(), c.memory_usage()));
            match cached {
                None => {
                    self.mem_tracker.consume(delvec.memory_usage() as i64);
                    entries.insert(tsid, Arc::clone(&delvec));
                }
                Some((cached_version, cached_bytes)) if latest_version > cached_version => {
                    self.mem_tracker.release(cached_bytes as i64);
                    self.mem_tracker.consume(delvec.memory_usage() as i64);
                    entries.insert(tsid, Arc::clone(&delvec));
                }
                Some(_) => {}
            }
        }
        Ok(delvec)
    }

    /// The newest delete vector of a segment, loading it on a miss.
    pub fn get_latest_del_vec(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
    ) -> Result<DelVectorPtr> {
        if let Some(cached) = self.entries.lock().get(&tsid) {
            return Ok(Arc::clone(cached));
        }

        let (delvec, _) = store.get_del_vector(tsid, i64::MAX)?;
        let delvec = Arc::new(delvec);
        let mut entries = self.entries.lock();
        if let Some(cached) = entries.get(&tsid) {
            // Published while we were loading; keep the newer one.
            if cached.version() >= delvec.version() {
                return Ok(Arc::clone(cached));
            }
        }
        if let Some(old) = entries.insert(tsid, Arc::clone(&delvec)) {
            self.mem_tracker.release(old.memory_usage() as i64);
        }
        self.mem_tracker.consume(delvec.memory_usage() as i64);
        Ok(delvec)
    }

    /// Publish a freshly computed delete vector.
    ///
    /// Fails with [`UpdateError::InvariantViolation`] and leaves the slot
    /// untouched if `delvec` is not strictly newer than the cached one.
    pub fn set_cached_del_vec(&self, tsid: TabletSegmentId, delvec: DelVectorPtr) -> Result<()> {
        debug!(
            tablet_id = tsid.tablet_id,
            segment_id = tsid.segment_id,
            version = delvec.version(),
            deletes = delvec.cardinality(),
            "set_cached_del_vec"
        );
        let mut entries = self.entries.lock();
        if let Some(cached) = entries.get(&tsid) {
            if delvec.version() <= cached.version() {
                let msg = format!(
                    "set_cached_del_vec {tsid}: new version({}) <= old version({})",
                    delvec.version(),
                    cached.version()
                );
                error!("{msg}");
                return Err(UpdateError::InvariantViolation(msg));
            }
        }
        self.mem_tracker.consume(delvec.memory_usage() as i64);
        if let Some(old) = entries.insert(tsid, delvec) {
            self.mem_tracker.release(old.memory_usage() as i64);
        }
        Ok(())
    }

    /// Drop every cached vector of a tablet. Returns how many were dropped.
    pub fn clear_by_tablet_id(&self, tablet_id: TabletId) -> usize {
        let mut entries = self.entries.lock();
        let keys: Vec<TabletSegmentId> = entries
            .range(TabletSegmentId::tablet_start(tablet_id)..)
            .take_while(|(k, _)| k.tablet_id == tablet_id)
            .map(|(k, _)| *k)
            .collect();
        self.remove_locked(&mut entries, &keys)
    }

    /// Drop the cached vectors of the given segments.
    pub fn clear(&self, tsids: &[TabletSegmentId]) -> usize {
        let mut entries = self.entries.lock();
        self.remove_locked(&mut entries, tsids)
    }

    /// Drop everything.
    pub fn clear_all(&self) {
        let mut entries = self.entries.lock();
        let bytes: usize = entries.values().map(|d| d.memory_usage()).sum();
        entries.clear();
        self.mem_tracker.release(bytes as i64);
    }

    /// Cached vector of a segment without touching the store.
    pub fn get_cached(&self, tsid: TabletSegmentId) -> Option<DelVectorPtr> {
        self.entries.lock().get(&tsid).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by cached vectors.
    pub fn memory_usage(&self) -> usize {
        self.entries.lock().values().map(|d| d.memory_usage()).sum()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    fn remove_locked(
        &self,
        entries: &mut BTreeMap<TabletSegmentId, DelVectorPtr>,
        keys: &[TabletSegmentId],
    ) -> usize {
        let mut removed = 0;
        for key in keys {
            if let Some(delvec) = entries.remove(key) {
                self.mem_tracker.release(delvec.memory_usage() as i64);
                removed += 1;
            }
        }
        removed
    }
}
