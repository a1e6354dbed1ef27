//! Per-segment delta column group cache.
//!
//! Each slot holds the segment's full list of delta column groups, most
//! recent first. An empty list is a real state ("this segment has no
//! deltas") and is distinct from a missing slot ("not loaded yet").

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::mem_tracker::MemTracker;
use crate::store::{FileSystem, MetaStore, WriteBatch};
use crate::types::{DeltaColumnGroupList, DeltaColumnGroupPtr, TabletId, TabletSegmentId};

/// Bytes held by a list of delta column groups.
pub fn list_memory_usage(list: &DeltaColumnGroupList) -> usize {
    list.iter().map(|dcg| dcg.memory_usage()).sum()
}

/// Deltas visible to a read at `version` (`dcg.version <= version`), most recent first.
pub fn search_by_version(list: &DeltaColumnGroupList, version: i64) -> DeltaColumnGroupList {
    list.iter().filter(|dcg| dcg.version() <= version).cloned().collect()
}

/// Remove deltas no read at `min_readable_version` or later can need.
///
/// Walking from newest to oldest, deltas at or below `min_readable_version`
/// accumulate the set of columns they cover. A delta older than
/// `min_readable_version` whose columns are all already covered by newer such
/// deltas is unreachable and is removed. Deltas at or above
/// `min_readable_version` are always kept. Returns the removed deltas.
pub fn garbage_collection(
    list: &mut DeltaColumnGroupList,
    min_readable_version: i64,
) -> Vec<DeltaColumnGroupPtr> {
    let mut covered: HashSet<u32> = HashSet::new();
    let mut removed = Vec::new();
    list.retain(|dcg| {
        if dcg.version() > min_readable_version {
            return true;
        }
        let redundant =
            dcg.version() < min_readable_version && dcg.columns().all(|c| covered.contains(&c));
        if redundant {
            removed.push(Arc::clone(dcg));
            return false;
        }
        covered.extend(dcg.columns());
        true
    });
    removed
}

pub struct DeltaColumnGroupCache {
    entries: Mutex<BTreeMap<TabletSegmentId, DeltaColumnGroupList>>,
    mem_tracker: Arc<MemTracker>,
    lock_budget: Duration,
    // Segment where the next GC sweep of a tablet resumes.
    gc_cursors: Mutex<HashMap<TabletId, u32>>,
}

impl DeltaColumnGroupCache {
    /// `lock_budget` bounds how long one GC sweep holds the cache lock.
    pub fn new(mem_tracker: Arc<MemTracker>, lock_budget: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            mem_tracker,
            lock_budget,
            gc_cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Deltas of `tsid` visible at `version`, or `None` if the segment is not cached.
    pub fn get_cached(&self, tsid: TabletSegmentId, version: i64) -> Option<DeltaColumnGroupList> {
        self.entries
            .lock()
            .get(&tsid)
            .map(|list| search_by_version(list, version))
    }

    /// Deltas of `tsid` visible at `version`, loading the segment's full list on a miss.
    pub fn get_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<DeltaColumnGroupList> {
        match self.get_cached(tsid, version) {
            Some(list) => Ok(list),
            None => self.load_delta_column_group(store, tsid, version),
        }
    }

    /// Load the full list of `tsid` from `store`, cache it if the slot is still
    /// empty (an empty list included), and return the deltas visible at `version`.
    pub fn load_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<DeltaColumnGroupList> {
        let full = store.get_delta_column_group(tsid, i64::MAX)?;
        let visible = search_by_version(&full, version);
        let mut entries = self.entries.lock();
        if !entries.contains_key(&tsid) {
            self.mem_tracker.consume(list_memory_usage(&full) as i64);
            entries.insert(tsid, full);
        }
        Ok(visible)
    }

    /// Record a newly produced delta.
    ///
    /// Prepended to the cached list if the segment is cached; otherwise the
    /// full list (which already contains the persisted delta) is loaded from
    /// the store so the slot never holds a partial view.
    pub fn set_cached_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        dcg: DeltaColumnGroupPtr,
    ) -> Result<()> {
        {
            let mut entries = self.entries.lock();
            if let Some(list) = entries.get_mut(&tsid) {
                self.mem_tracker.consume(dcg.memory_usage() as i64);
                list.insert(0, dcg);
                return Ok(());
            }
        }

        let full = store.get_delta_column_group(tsid, i64::MAX)?;
        let mut entries = self.entries.lock();
        self.mem_tracker.consume(list_memory_usage(&full) as i64);
        if let Some(old) = entries.insert(tsid, full) {
            self.mem_tracker.release(list_memory_usage(&old) as i64);
        }
        Ok(())
    }

    /// Seed an empty slot for a segment the store has no deltas for, so reads
    /// stop querying the store. No-op if the slot exists or the store has deltas.
    pub fn set_cached_empty_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
    ) -> Result<()> {
        if self.entries.lock().contains_key(&tsid) {
            return Ok(());
        }
        let full = store.get_delta_column_group(tsid, i64::MAX)?;
        let mut entries = self.entries.lock();
        if !entries.contains_key(&tsid) && full.is_empty() {
            entries.insert(tsid, full);
        }
        Ok(())
    }

    /// Garbage-collect deltas of `tablet_id` that are unreachable at
    /// `min_readable_version`: drop them from the cache, delete them from the
    /// store in one batch and remove their files under `tablet_path`.
    ///
    /// Holds the lock for at most the configured budget. A sweep cut short
    /// remembers where it stopped and the next call resumes there, wrapping
    /// around to the tablet's first segment. Returns the number of deltas removed.
    pub fn clear_delta_column_group_before_version(
        &self,
        store: &dyn MetaStore,
        fs: &dyn FileSystem,
        tablet_path: &Path,
        tablet_id: TabletId,
        min_readable_version: i64,
    ) -> Result<usize> {
        let mut garbage: Vec<(TabletSegmentId, i64)> = Vec::new();
        let mut files: Vec<PathBuf> = Vec::new();
        {
            let start = Instant::now();
            let mut scanned = 0usize;
            let mut entries = self.entries.lock();
            let mut cursors = self.gc_cursors.lock();
            let resume_segment = cursors.get(&tablet_id).copied().unwrap_or(0);
            let resume = TabletSegmentId::new(tablet_id, resume_segment);
            let order: Vec<TabletSegmentId> = entries
                .range(resume..)
                .take_while(|(k, _)| k.tablet_id == tablet_id)
                .chain(entries.range(TabletSegmentId::tablet_start(tablet_id)..resume))
                .map(|(k, _)| *k)
                .collect();

            let mut stopped_at = None;
            for tsid in order {
                if scanned > 0 && start.elapsed() >= self.lock_budget {
                    debug!(tablet_id, scanned, "Delta column group GC yielded the lock");
                    stopped_at = Some(tsid.segment_id);
                    break;
                }
                scanned += 1;
                let Some(list) = entries.get_mut(&tsid) else {
                    continue;
                };
                for dcg in garbage_collection(list, min_readable_version) {
                    self.mem_tracker.release(dcg.memory_usage() as i64);
                    files.extend(dcg.column_file_paths(tablet_path));
                    garbage.push((tsid, dcg.version()));
                }
            }
            match stopped_at {
                Some(segment_id) => cursors.insert(tablet_id, segment_id),
                None => cursors.remove(&tablet_id),
            };
        }

        let mut batch = WriteBatch::new();
        for (tsid, version) in &garbage {
            if let Err(err) = store.delete_delta_column_group(&mut batch, *tsid, *version) {
                warn!(tablet_id, %tsid, version, error = %err, "Clear delta column group failed");
            }
        }
        store.write_batch(batch)?;

        for file in &files {
            if let Err(err) = fs.delete_file(file) {
                warn!(path = %file.display(), error = %err, "Delete delta column file failed");
            }
        }

        if !garbage.is_empty() {
            debug!(
                tablet_id,
                min_readable_version,
                removed = garbage.len(),
                "Delta column group GC done"
            );
        }
        Ok(garbage.len())
    }

    /// Drop every cached list of a tablet. Returns how many slots were dropped.
    pub fn clear_by_tablet_id(&self, tablet_id: TabletId) -> usize {
        self.gc_cursors.lock().remove(&tablet_id);
        let mut entries = self.entries.lock();
        let keys: Vec<TabletSegmentId> = entries
            .range(TabletSegmentId::tablet_start(tablet_id)..)
            .take_while(|(k, _)| k.tablet_id == tablet_id)
            .map(|(k, _)| *k)
            .collect();
        self.remove_locked(&mut entries, &keys)
    }

    /// Drop the cached lists of the given segments.
    pub fn clear(&self, tsids: &[TabletSegmentId]) -> usize {
        let mut entries = self.entries.lock();
        self.remove_locked(&mut entries, tsids)
    }

    pub fn clear_all(&self) {
        self.gc_cursors.lock().clear();
        let mut entries = self.entries.lock();
        let bytes: usize = entries.values().map(list_memory_usage).sum();
        entries.clear();
        self.mem_tracker.release(bytes as i64);
    }

    /// Number of cached segments.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.entries.lock().values().map(list_memory_usage).sum()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    fn remove_locked(
        &self,
        entries: &mut BTreeMap<TabletSegmentId, DeltaColumnGroupList>,
        keys: &[TabletSegmentId],
    ) -> usize {
        let mut removed = 0;
        for key in keys {
            if let Some(list) = entries.remove(key) {
                self.mem_tracker.release(list_memory_usage(&list) as i64);
                removed += 1;
            }
        }
        removed
    }
}
