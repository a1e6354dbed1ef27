//! Segment-reader view of the caches.
//!
//! A segment reader resolves its delete vector and delta column groups
//! through these traits instead of talking to the [`UpdateManager`] and the
//! metadata store directly.

use std::sync::Arc;

use crate::error::Result;
use crate::manager::UpdateManager;
use crate::store::MetaStore;
use crate::types::{DelVectorPtr, DeltaColumnGroupList, TabletSegmentId};

pub trait DelvecLoader: Send + Sync {
    /// Delete vector of `tsid` usable by a read at `version`.
    fn load(&self, tsid: TabletSegmentId, version: i64) -> Result<DelVectorPtr>;
}

pub trait DeltaColumnGroupLoader: Send + Sync {
    /// Delta column groups of `tsid` visible at `version`, most recent first.
    fn load(&self, tsid: TabletSegmentId, version: i64) -> Result<DeltaColumnGroupList>;
}

/// Delete vectors of a local tablet, served through the manager's cache.
pub struct LocalDelvecLoader {
    manager: Arc<UpdateManager>,
    store: Arc<dyn MetaStore>,
}

impl LocalDelvecLoader {
    pub fn new(manager: Arc<UpdateManager>, store: Arc<dyn MetaStore>) -> Self {
        Self { manager, store }
    }
}

impl DelvecLoader for LocalDelvecLoader {
    fn load(&self, tsid: TabletSegmentId, version: i64) -> Result<DelVectorPtr> {
        self.manager.get_del_vec(self.store.as_ref(), tsid, version)
    }
}

/// Delta column groups of a local tablet, served through the manager's cache.
///
/// Without a metadata store (a tablet that never had column-mode updates)
/// every segment has no deltas.
pub struct LocalDeltaColumnGroupLoader {
    manager: Arc<UpdateManager>,
    store: Option<Arc<dyn MetaStore>>,
}

impl LocalDeltaColumnGroupLoader {
    pub fn new(manager: Arc<UpdateManager>, store: Option<Arc<dyn MetaStore>>) -> Self {
        Self { manager, store }
    }
}

impl DeltaColumnGroupLoader for LocalDeltaColumnGroupLoader {
    fn load(&self, tsid: TabletSegmentId, version: i64) -> Result<DeltaColumnGroupList> {
        match &self.store {
            Some(store) => self.manager.get_delta_column_group(store.as_ref(), tsid, version),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::UpdateError;
    use crate::ingest::{PrimaryIndex, PrimaryIndexLoader, UpdateState, UpdateStateLoader};
    use crate::manager::Collaborators;
    use crate::mem_tracker::MemTracker;
    use crate::store::fs::LocalFileSystem;
    use crate::store::memory::MemoryMetaStore;
    use crate::types::{DelVector, DeltaColumnGroup, Rowset, Tablet};

    struct NoLoad;

    impl PrimaryIndexLoader for NoLoad {
        fn load(&self, _tablet: &dyn Tablet, _keep_bf: bool) -> Result<Arc<dyn PrimaryIndex>> {
            Err(UpdateError::Uninitialized("no index".into()))
        }
    }

    impl UpdateStateLoader for NoLoad {
        fn load(
            &self,
            _tablet: &dyn Tablet,
            _rowset: &Rowset,
            _mem_tracker: &Arc<MemTracker>,
        ) -> Result<Box<dyn UpdateState>> {
            Err(UpdateError::Uninitialized("no state".into()))
        }
    }

    fn manager() -> Arc<UpdateManager> {
        let loaders = Arc::new(NoLoad);
        let manager = UpdateManager::new(
            Arc::new(Config::default()),
            &MemTracker::root("process", -1),
            Collaborators {
                index_loader: loaders.clone(),
                row_state_loader: loaders.clone(),
                column_state_loader: loaders,
                fs: Arc::new(LocalFileSystem),
            },
        )
        .unwrap();
        Arc::new(manager)
    }

    #[test]
    fn test_delvec_loader_reads_through_cache() {
        let mgr = manager();
        let store = MemoryMetaStore::shared();
        let tsid = TabletSegmentId::new(5, 1);
        store.set_del_vector(tsid, &DelVector::from_rows(2, [4, 8])).unwrap();

        let loader = LocalDelvecLoader::new(Arc::clone(&mgr), store.clone());
        let dv = loader.load(tsid, 2).unwrap();
        assert_eq!(dv.cardinality(), 2);
        assert!(dv.is_deleted(8));
        loader.load(tsid, 2).unwrap();
        assert_eq!(store.del_vector_reads(), 1);
        assert_eq!(mgr.del_vec_cache().len(), 1);
    }

    #[test]
    fn test_dcg_loader_without_store_is_empty() {
        let mgr = manager();
        let loader = LocalDeltaColumnGroupLoader::new(Arc::clone(&mgr), None);
        assert!(loader.load(TabletSegmentId::new(5, 1), 10).unwrap().is_empty());
        assert!(mgr.delta_column_group_cache().is_empty());
    }

    #[test]
    fn test_dcg_loader_filters_by_version() {
        let mgr = manager();
        let store = MemoryMetaStore::shared();
        let tsid = TabletSegmentId::new(5, 1);
        for (version, file) in [(3, "a"), (6, "b")] {
            let dcg = DeltaColumnGroup::new(version, vec![vec![1]], vec![file.to_string()]);
            store.put_delta_column_group(tsid, dcg);
        }

        let loader = LocalDeltaColumnGroupLoader::new(Arc::clone(&mgr), Some(store.clone()));
        let visible = loader.load(tsid, 4).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].version(), 3);
        assert_eq!(loader.load(tsid, 10).unwrap().len(), 2);
        assert_eq!(store.dcg_reads(), 1);
    }
}
