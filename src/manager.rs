//! Update manager: owns every update-related cache and memory tracker.
//!
//! The manager is the single entry point used by the read, apply and ingest
//! paths. It:
//! - Builds the memory tracker tree (one update root, five pools)
//! - Routes delete vector and delta column group lookups to their caches
//! - Runs the rowset lifecycle hooks
//! - Expires and evicts the refcounted caches on behalf of a periodic driver

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::del_vec::DelVecCache;
use crate::cache::delta_column::DeltaColumnGroupCache;
use crate::cache::evictor::{EvictionOrder, Watermarks};
use crate::cache::monotonic_millis;
use crate::config::Config;
use crate::error::Result;
use crate::ingest::coordinator::{IngestCoordinator, StateCaches};
use crate::ingest::index_loader::IndexLoadExecutor;
use crate::ingest::{IndexCache, PrimaryIndexLoader, StateCache, UpdateStateLoader};
use crate::mem_tracker::MemTracker;
use crate::metrics::UpdateMetrics;
use crate::store::{FileSystem, MetaStore};
use crate::types::{
    DelVectorPtr, DeltaColumnGroupList, DeltaColumnGroupPtr, Rowset, Tablet, TabletId,
    TabletSegmentId,
};

const DETAIL_STATS_MAX_ROWS: usize = 200;

/// External collaborators the manager loads through.
pub struct Collaborators {
    pub index_loader: Arc<dyn PrimaryIndexLoader>,
    pub row_state_loader: Arc<dyn UpdateStateLoader>,
    pub column_state_loader: Arc<dyn UpdateStateLoader>,
    pub fs: Arc<dyn FileSystem>,
}

/// Memory trackers of the update subsystem.
pub struct Trackers {
    pub update: Arc<MemTracker>,
    pub index_cache: Arc<MemTracker>,
    pub row_state: Arc<MemTracker>,
    pub column_state: Arc<MemTracker>,
    pub del_vec_cache: Arc<MemTracker>,
    pub delta_column_group_cache: Arc<MemTracker>,
}

impl Trackers {
    fn new(config: &Config, process: &Arc<MemTracker>) -> Self {
        let update = MemTracker::child("update", config.update_mem_limit(), process);
        let preload_limit = config.preload_mem_limit();
        Self {
            index_cache: MemTracker::child("index_cache", -1, &update),
            row_state: MemTracker::child("rowset_update_state", preload_limit, &update),
            column_state: MemTracker::child("rowset_column_update_state", preload_limit, &update),
            del_vec_cache: MemTracker::child("del_vec_cache", -1, &update),
            delta_column_group_cache: MemTracker::child("delta_column_group_cache", -1, &update),
            update,
        }
    }
}

pub struct UpdateManager {
    config: Arc<Config>,
    trackers: Trackers,

    index_cache: Arc<IndexCache>,
    row_state_cache: Arc<StateCache>,
    column_state_cache: Arc<StateCache>,
    del_vec_cache: DelVecCache,
    delta_column_group_cache: DeltaColumnGroupCache,

    index_loader: Arc<IndexLoadExecutor>,
    ingest: IngestCoordinator,
    fs: Arc<dyn FileSystem>,
    metrics: UpdateMetrics,

    keep_pindex_bf: Arc<AtomicBool>,
    last_clear_expired_ms: AtomicI64,
}

impl UpdateManager {
    /// Build the manager with its trackers attached under `process_tracker`.
    pub fn new(
        config: Arc<Config>,
        process_tracker: &Arc<MemTracker>,
        deps: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let trackers = Trackers::new(&config, process_tracker);
        let expire_ms = config.cache_expire_ms();

        let index_capacity = config.update_mem_limit().max(0) as usize;
        let index_cache = Arc::new(
            IndexCache::new("primary_index", index_capacity, expire_ms, EvictionOrder::LargestFirst)
                .with_mem_tracker(Arc::clone(&trackers.index_cache)),
        );
        let row_state_cache = Arc::new(
            StateCache::new(
                "rowset_update_state",
                usize::MAX,
                expire_ms,
                EvictionOrder::LeastRecentlyUsed,
            )
            .with_mem_tracker(Arc::clone(&trackers.row_state)),
        );
        let column_state_cache = Arc::new(
            StateCache::new(
                "rowset_column_update_state",
                usize::MAX,
                expire_ms,
                EvictionOrder::LeastRecentlyUsed,
            )
            .with_mem_tracker(Arc::clone(&trackers.column_state)),
        );

        let keep_pindex_bf = Arc::new(AtomicBool::new(true));
        let index_loader = Arc::new(IndexLoadExecutor::new(
            Arc::clone(&index_cache),
            deps.index_loader,
            Arc::clone(&keep_pindex_bf),
        ));
        let ingest = IngestCoordinator::new(
            StateCaches {
                row_cache: Arc::clone(&row_state_cache),
                row_loader: deps.row_state_loader,
                row_tracker: Arc::clone(&trackers.row_state),
                column_cache: Arc::clone(&column_state_cache),
                column_loader: deps.column_state_loader,
                column_tracker: Arc::clone(&trackers.column_state),
            },
            Arc::clone(&index_loader),
            config.index_load_wait(),
        );

        info!(
            update_limit = %pretty_bytes(config.update_mem_limit()),
            preload_limit = %pretty_bytes(config.preload_mem_limit()),
            expire_sec = config.cache.expire_sec,
            "Update manager initialized"
        );

        Ok(Self {
            del_vec_cache: DelVecCache::new(Arc::clone(&trackers.del_vec_cache)),
            delta_column_group_cache: DeltaColumnGroupCache::new(
                Arc::clone(&trackers.delta_column_group_cache),
                config.dcg_lock_budget(),
            ),
            metrics: UpdateMetrics::new()?,
            config,
            trackers,
            index_cache,
            row_state_cache,
            column_state_cache,
            index_loader,
            ingest,
            fs: deps.fs,
            keep_pindex_bf,
            last_clear_expired_ms: AtomicI64::new(i64::MIN),
        })
    }

    // ---- delete vectors ----

    pub fn get_del_vec(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<DelVectorPtr> {
        self.del_vec_cache.get_del_vec(store, tsid, version)
    }

    pub fn get_latest_del_vec(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
    ) -> Result<DelVectorPtr> {
        self.del_vec_cache.get_latest_del_vec(store, tsid)
    }

    pub fn set_cached_del_vec(&self, tsid: TabletSegmentId, delvec: DelVectorPtr) -> Result<()> {
        self.del_vec_cache.set_cached_del_vec(tsid, delvec)
    }

    pub fn clear_cached_del_vec(&self, tsids: &[TabletSegmentId]) {
        self.del_vec_cache.clear(tsids);
    }

    pub fn clear_cached_del_vec_by_tablet_id(&self, tablet_id: TabletId) {
        let removed = self.del_vec_cache.clear_by_tablet_id(tablet_id);
        debug!(tablet_id, removed, "Cleared cached delete vectors");
    }

    // ---- delta column groups ----

    pub fn get_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<DeltaColumnGroupList> {
        self.metrics.dcg_get_total.inc();
        if let Some(list) = self.delta_column_group_cache.get_cached(tsid, version) {
            self.metrics.dcg_get_hit_cache.inc();
            return Ok(list);
        }
        self.delta_column_group_cache
            .load_delta_column_group(store, tsid, version)
    }

    /// Cached deltas of `tsid` visible at `version`; `None` if not cached.
    pub fn get_cached_delta_column_group(
        &self,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Option<DeltaColumnGroupList> {
        self.delta_column_group_cache.get_cached(tsid, version)
    }

    pub fn set_cached_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
        dcg: DeltaColumnGroupPtr,
    ) -> Result<()> {
        self.delta_column_group_cache
            .set_cached_delta_column_group(store, tsid, dcg)
    }

    pub fn set_cached_empty_delta_column_group(
        &self,
        store: &dyn MetaStore,
        tsid: TabletSegmentId,
    ) -> Result<()> {
        self.delta_column_group_cache
            .set_cached_empty_delta_column_group(store, tsid)
    }

    pub fn clear_delta_column_group_before_version(
        &self,
        store: &dyn MetaStore,
        tablet_path: &Path,
        tablet_id: TabletId,
        min_readable_version: i64,
    ) -> Result<usize> {
        self.delta_column_group_cache.clear_delta_column_group_before_version(
            store,
            self.fs.as_ref(),
            tablet_path,
            tablet_id,
            min_readable_version,
        )
    }

    pub fn clear_cached_delta_column_group(&self, tsids: &[TabletSegmentId]) {
        self.delta_column_group_cache.clear(tsids);
    }

    pub fn clear_cached_delta_column_group_by_tablet_id(&self, tablet_id: TabletId) {
        let removed = self.delta_column_group_cache.clear_by_tablet_id(tablet_id);
        debug!(tablet_id, removed, "Cleared cached delta column groups");
    }

    // ---- ingestion ----

    pub fn on_rowset_finished(&self, tablet: &Arc<dyn Tablet>, rowset: &Rowset) -> Result<()> {
        self.ingest.on_rowset_finished(tablet, rowset)
    }

    pub fn on_rowset_cancel(&self, tablet: &dyn Tablet, rowset: &Rowset) {
        self.ingest.on_rowset_cancel(tablet, rowset)
    }

    // ---- maintenance ----

    /// Drop every unreferenced entry of every cache.
    pub fn clear_cache(&self) {
        let rows = self.row_state_cache.clear();
        let columns = self.column_state_cache.clear();
        let indexes = self.index_cache.clear();
        self.del_vec_cache.clear_all();
        self.delta_column_group_cache.clear_all();
        self.metrics.reset_gauges();
        info!(rows, columns, indexes, "Cleared update caches");
    }

    /// Publish cache gauges and, at most once per TTL, drop expired entries.
    pub fn expire_cache(&self) {
        self.refresh_gauges();

        let now = monotonic_millis();
        let last = self.last_clear_expired_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) <= self.config.cache_expire_ms() {
            return;
        }
        if self
            .last_clear_expired_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread is sweeping.
            return;
        }

        self.row_state_cache.clear_expired();
        self.column_state_cache.clear_expired();

        let (orig_size, orig_objs) = (self.index_cache.size(), self.index_cache.object_size());
        self.index_cache.clear_expired();
        let (size, objs) = (self.index_cache.size(), self.index_cache.object_size());
        info!(
            "index cache expire: before:({} {}) after:({} {}) expire: ({} {})",
            orig_objs,
            pretty_bytes(orig_size as i64),
            objs,
            pretty_bytes(size as i64),
            orig_objs.saturating_sub(objs),
            pretty_bytes(orig_size.saturating_sub(size) as i64)
        );
    }

    /// Shrink the index cache under memory pressure.
    ///
    /// Both levels are percentages of the index cache capacity. Above
    /// `urgent_pct` the cache is evicted straight down to it; if still above
    /// `high_pct` it is evicted to the damped target.
    pub fn evict_cache(&self, urgent_pct: i64, high_pct: i64) {
        let capacity = self.index_cache.capacity().min(i64::MAX as usize) as i64;
        let marks = Watermarks::new(capacity, urgent_pct, high_pct);

        let size = self.index_cache.size() as i64;
        if let Some(target) = marks.urgent_target(size) {
            self.index_cache.try_evict(target.max(0) as usize);
        }
        let size = self.index_cache.size() as i64;
        if let Some(target) = marks.high_target(size, self.config.eviction.damping_percent) {
            self.index_cache.try_evict(target.max(0) as usize);
        }

        let size = self.index_cache.size() as i64;
        let keep = size <= marks.high;
        if self.keep_pindex_bf.swap(keep, Ordering::AcqRel) != keep {
            debug!(keep, size, high = marks.high, "Primary index bloom filter retention changed");
        }
    }

    /// Whether primary index loads should keep their lookup bloom filter.
    pub fn keep_pindex_bf(&self) -> bool {
        self.keep_pindex_bf.load(Ordering::Acquire)
    }

    fn refresh_gauges(&self) {
        self.metrics
            .primary_index_num
            .set(self.index_cache.object_size() as i64);
        self.metrics
            .primary_index_bytes
            .set(self.index_cache.size() as i64);
        self.metrics.del_vector_num.set(self.del_vec_cache.len() as i64);
        self.metrics
            .del_vector_bytes
            .set(self.del_vec_cache.memory_usage() as i64);
    }

    // ---- diagnostics ----

    /// One-line per-pool memory summary.
    pub fn memory_stats(&self) -> String {
        let t = &self.trackers;
        format!(
            "index:{} rowset:{} column:{} delvec:{} dcg:{} total:{}/{}",
            pretty_bytes(t.index_cache.consumption()),
            pretty_bytes(t.row_state.consumption()),
            pretty_bytes(t.column_state.consumption()),
            pretty_bytes(t.del_vec_cache.consumption()),
            pretty_bytes(t.delta_column_group_cache.consumption()),
            pretty_bytes(t.update.consumption()),
            t.update
                .limit()
                .map(pretty_bytes)
                .unwrap_or_else(|| "unlimited".to_string()),
        )
    }

    /// Primary index entries, largest first.
    pub fn detail_memory_stats(&self) -> String {
        let stats = self.sorted_index_sizes();
        let total: usize = stats.iter().map(|(_, size)| size).sum();
        let mut out = format!(
            "primary index stats: total:{} memory:{}\n  tabletid       memory\n",
            stats.len(),
            total
        );
        for (tablet_id, size) in stats.iter().take(DETAIL_STATS_MAX_ROWS) {
            out.push_str(&format!("{tablet_id:>10} {size:>12}\n"));
        }
        out
    }

    /// The `n` largest primary indexes as `tablet(NM)`.
    pub fn topn_memory_stats(&self, n: usize) -> String {
        self.sorted_index_sizes()
            .iter()
            .take(n)
            .map(|(tablet_id, size)| format!("{}({}M)", tablet_id, size / (1024 * 1024)))
            .collect()
    }

    fn sorted_index_sizes(&self) -> Vec<(TabletId, usize)> {
        let mut stats = self.index_cache.get_entry_sizes();
        stats.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        stats
    }

    pub fn metrics_text(&self) -> Result<String> {
        self.refresh_gauges();
        self.metrics.metrics_text()
    }

    // ---- test hooks ----

    pub fn test_update_state_exist(&self, tablet_id: TabletId, rowset: &Rowset) -> bool {
        self.ingest.test_update_state_exist(tablet_id, rowset)
    }

    /// Whether the index entry of `tablet_id` has `expected` outstanding
    /// references (0 also matches a missing entry).
    pub fn test_primary_index_refcnt(&self, tablet_id: TabletId, expected: u32) -> bool {
        match self.index_cache.get(&tablet_id) {
            Some(entry) => {
                self.index_cache.release(&entry);
                entry.get_ref() == expected
            }
            None => expected == 0,
        }
    }

    // ---- accessors ----

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn trackers(&self) -> &Trackers {
        &self.trackers
    }

    pub fn index_cache(&self) -> &Arc<IndexCache> {
        &self.index_cache
    }

    pub fn row_state_cache(&self) -> &Arc<StateCache> {
        &self.row_state_cache
    }

    pub fn column_state_cache(&self) -> &Arc<StateCache> {
        &self.column_state_cache
    }

    pub fn del_vec_cache(&self) -> &DelVecCache {
        &self.del_vec_cache
    }

    pub fn delta_column_group_cache(&self) -> &DeltaColumnGroupCache {
        &self.delta_column_group_cache
    }

    /// Refuse new preloads and drop every cache.
    pub fn stop(&self) {
        self.index_loader.shutdown();
        self.clear_cache();
    }
}

impl Drop for UpdateManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Human-readable byte count (`1.50 GB`).
pub fn pretty_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
