//! End-to-end tests through the update manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pk_update_cache::config::Config;
use pk_update_cache::error::{Result, UpdateError};
use pk_update_cache::ingest::{PrimaryIndex, PrimaryIndexLoader, UpdateState, UpdateStateLoader};
use pk_update_cache::manager::{Collaborators, UpdateManager};
use pk_update_cache::mem_tracker::MemTracker;
use pk_update_cache::store::fs::LocalFileSystem;
use pk_update_cache::store::memory::MemoryMetaStore;
use pk_update_cache::store::MetaStore;
use pk_update_cache::types::{
    DelVector, DeltaColumnGroup, Rowset, Tablet, TabletId, TabletSegmentId, TabletState, UpdateMode,
};

struct TestTablet {
    id: TabletId,
    state: TabletState,
    index_expire_sec: i32,
}

impl TestTablet {
    fn running(id: TabletId) -> Arc<dyn Tablet> {
        Arc::new(Self {
            id,
            state: TabletState::Running,
            index_expire_sec: 0,
        })
    }
}

impl Tablet for TestTablet {
    fn tablet_id(&self) -> TabletId {
        self.id
    }

    fn state(&self) -> TabletState {
        self.state
    }

    fn primary_index_cache_expire_sec(&self) -> i32 {
        self.index_expire_sec
    }
}

struct Bytes(usize);

impl PrimaryIndex for Bytes {
    fn memory_usage(&self) -> usize {
        self.0
    }
}

impl UpdateState for Bytes {
    fn memory_usage(&self) -> usize {
        self.0
    }
}

/// Index loader whose latency and outcome are set per test.
struct IndexBuilder {
    delay: Duration,
    bytes: usize,
    loads: AtomicUsize,
}

impl PrimaryIndexLoader for IndexBuilder {
    fn load(
        &self,
        _tablet: &dyn Tablet,
        _keep_bloom_filter: bool,
    ) -> Result<Arc<dyn PrimaryIndex>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(Arc::new(Bytes(self.bytes)))
    }
}

/// State loader that charges its tracker and fails when over its limit.
struct StateBuilder {
    bytes: usize,
}

impl UpdateStateLoader for StateBuilder {
    fn load(
        &self,
        _tablet: &dyn Tablet,
        _rowset: &Rowset,
        mem_tracker: &Arc<MemTracker>,
    ) -> Result<Box<dyn UpdateState>> {
        if mem_tracker.would_exceed_limit(self.bytes as i64) {
            return Err(UpdateError::MemoryLimitExceeded(format!(
                "{} would exceed {:?}",
                self.bytes,
                mem_tracker.limit()
            )));
        }
        Ok(Box::new(Bytes(self.bytes)))
    }
}

struct Harness {
    manager: UpdateManager,
    process: Arc<MemTracker>,
    index: Arc<IndexBuilder>,
}

fn harness(config: Config, index_delay: Duration, state_bytes: usize) -> Harness {
    let process = MemTracker::root("process", -1);
    let index = Arc::new(IndexBuilder {
        delay: index_delay,
        bytes: 2048,
        loads: AtomicUsize::new(0),
    });
    let state = Arc::new(StateBuilder { bytes: state_bytes });
    let manager = UpdateManager::new(
        Arc::new(config),
        &process,
        Collaborators {
            index_loader: index.clone(),
            row_state_loader: state.clone(),
            column_state_loader: state,
            fs: Arc::new(LocalFileSystem),
        },
    )
    .unwrap();
    Harness {
        manager,
        process,
        index,
    }
}

fn limited(update_bytes: i64) -> Config {
    let mut config = Config::default();
    config.memory.process_mem_limit = update_bytes;
    config.memory.update_memory_limit_percent = 100;
    config
}

#[test]
fn test_read_path_scenario() {
    let h = harness(Config::default(), Duration::ZERO, 128);
    let store = MemoryMetaStore::new();
    let tsid = TabletSegmentId::new(7, 3);
    store.set_del_vector(tsid, &DelVector::from_rows(1, [2, 5])).unwrap();
    store.set_del_vector(tsid, &DelVector::from_rows(3, [2, 5, 9])).unwrap();

    let first = h.manager.get_del_vec(&store, tsid, 2).unwrap();
    assert_eq!(first.version(), 1);
    assert_eq!(first.cardinality(), 2);

    let second = h.manager.get_del_vec(&store, tsid, 3).unwrap();
    assert_eq!(second.version(), 3);

    let reads = store.del_vector_reads();
    let third = h.manager.get_del_vec(&store, tsid, 2).unwrap();
    assert_eq!(third.version(), 3);
    assert!(Arc::ptr_eq(&second, &third));
    assert_eq!(store.del_vector_reads(), reads);

    // The process root sees the delete vector pool.
    assert_eq!(h.process.consumption() as usize, third.memory_usage());

    h.manager.clear_cached_del_vec_by_tablet_id(7);
    assert_eq!(h.process.consumption(), 0);
}

#[test]
fn test_soft_memory_failure_reports_ok() {
    // preload limit = 30% of 1000 = 300 bytes
    let h = harness(limited(1000), Duration::ZERO, 4096);
    let rowset = Rowset::new("r1", 2, UpdateMode::Full);

    h.manager
        .on_rowset_finished(&TestTablet::running(10), &rowset)
        .unwrap();
    assert!(!h.manager.test_update_state_exist(10, &rowset));
    assert_eq!(h.manager.trackers().row_state.consumption(), 0);
}

#[test]
fn test_column_mode_state_is_separate() {
    let h = harness(Config::default(), Duration::ZERO, 128);
    let tablet = TestTablet::running(3);
    let column = Rowset::new("c1", 1, UpdateMode::ColumnPartial);
    let row = Rowset::new("r1", 1, UpdateMode::Full);

    h.manager.on_rowset_finished(&tablet, &column).unwrap();
    h.manager.on_rowset_finished(&tablet, &row).unwrap();
    assert_eq!(h.manager.column_state_cache().size(), 128);
    assert_eq!(h.manager.row_state_cache().size(), 128);
    assert_eq!(h.index.loads.load(Ordering::SeqCst), 1);

    h.manager.on_rowset_cancel(tablet.as_ref(), &column);
    assert_eq!(h.manager.column_state_cache().size(), 0);
    assert!(h.manager.test_update_state_exist(3, &row));
}

#[test]
fn test_index_preload_timeout_is_uninitialized() {
    let mut config = Config::default();
    config.preload.index_load_wait_secs = 0;
    let h = harness(config, Duration::from_millis(200), 128);
    let rowset = Rowset::new("p1", 1, UpdateMode::RowPartial);

    let err = h
        .manager
        .on_rowset_finished(&TestTablet::running(5), &rowset)
        .unwrap_err();
    assert!(matches!(err, UpdateError::Uninitialized(_)));
    assert!(!h.manager.test_update_state_exist(5, &rowset));
}

#[test]
fn test_per_tablet_index_ttl() {
    let mut config = Config::default();
    config.cache.expire_sec = 0;
    let h = harness(config, Duration::ZERO, 128);
    let short = TestTablet::running(1);
    let long: Arc<dyn Tablet> = Arc::new(TestTablet {
        id: 2,
        state: TabletState::Running,
        index_expire_sec: 3600,
    });
    let rowset = Rowset::new("p1", 1, UpdateMode::RowPartial);
    h.manager.on_rowset_finished(&short, &rowset).unwrap();
    h.manager.on_rowset_finished(&long, &rowset).unwrap();
    assert_eq!(h.manager.index_cache().object_size(), 2);

    h.manager.expire_cache();
    assert!(h.manager.test_primary_index_refcnt(1, 0));
    assert!(h.manager.index_cache().get(&1).is_none());
    let kept = h.manager.index_cache().get(&2).unwrap();
    h.manager.index_cache().release(&kept);
}

#[test]
fn test_eviction_turns_off_bloom_filter() {
    // index capacity 10_000: urgent 85% = 8500, high 75% = 7500
    let h = harness(limited(10_000), Duration::ZERO, 16);
    let rowset = Rowset::new("p1", 1, UpdateMode::RowPartial);
    for tablet_id in 0..4 {
        h.manager
            .on_rowset_finished(&TestTablet::running(tablet_id), &rowset)
            .unwrap();
    }
    assert_eq!(h.manager.index_cache().size(), 8192);

    // Pin everything so nothing can go.
    let pinned: Vec<_> = (0..4)
        .map(|id| h.manager.index_cache().get(&id).unwrap())
        .collect();
    h.manager.evict_cache(85, 75);
    assert!(!h.manager.keep_pindex_bf());
    assert_eq!(h.manager.index_cache().size(), 8192);

    for entry in &pinned {
        h.manager.index_cache().release(entry);
    }
    h.manager.evict_cache(85, 75);
    assert!(h.manager.keep_pindex_bf());
    assert_eq!(h.manager.index_cache().size(), 6144);
}

#[test]
fn test_delta_column_gc_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Config::default(), Duration::ZERO, 128);
    let store = MemoryMetaStore::new();
    let tsid = TabletSegmentId::new(4, 0);
    for version in [1, 3] {
        let file = format!("d{version}.cols");
        std::fs::write(dir.path().join(&file), b"x").unwrap();
        let dcg = DeltaColumnGroup::new(version, vec![vec![2]], vec![file]);
        store.put_delta_column_group(tsid, dcg);
    }
    assert_eq!(h.manager.get_delta_column_group(&store, tsid, 3).unwrap().len(), 2);

    let removed = h
        .manager
        .clear_delta_column_group_before_version(&store, dir.path(), 4, 5)
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!dir.path().join("d1.cols").exists());
    assert_eq!(h.manager.get_cached_delta_column_group(tsid, 5).unwrap().len(), 1);

    h.manager.clear_cached_delta_column_group(&[tsid]);
    assert!(h.manager.get_cached_delta_column_group(tsid, 5).is_none());
    assert_eq!(h.manager.trackers().delta_column_group_cache.consumption(), 0);
}

#[test]
fn test_stop_releases_everything() {
    let h = harness(Config::default(), Duration::ZERO, 128);
    let store = MemoryMetaStore::new();
    let tsid = TabletSegmentId::new(1, 0);
    store.set_del_vector(tsid, &DelVector::from_rows(1, [0])).unwrap();
    h.manager.get_del_vec(&store, tsid, 1).unwrap();
    h.manager
        .on_rowset_finished(&TestTablet::running(1), &Rowset::new("p1", 1, UpdateMode::RowPartial))
        .unwrap();
    assert!(h.process.consumption() > 0);

    h.manager.stop();
    assert_eq!(h.process.consumption(), 0);
    let err = h
        .manager
        .on_rowset_finished(&TestTablet::running(2), &Rowset::new("p2", 1, UpdateMode::RowPartial))
        .unwrap_err();
    assert!(matches!(err, UpdateError::Uninitialized(_)));
}
