//! Rowset lifecycle hooks.
//!
//! When a rowset finishes writing, its update state is materialized into the
//! row-mode or column-mode state cache so the later apply does not have to
//! build it. Partial updates also need the tablet's primary index, which is
//! preloaded first with a bounded wait. Everything here is an optimization:
//! memory pressure and timeouts drop the entry and report success.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, UpdateError};
use crate::ingest::index_loader::IndexLoadExecutor;
use crate::ingest::{StateCache, UpdateStateLoader};
use crate::mem_tracker::MemTracker;
use crate::types::{rowset_state_key, Rowset, Tablet, TabletState};

/// One of the two mutually exclusive state caches with its loader.
struct StatePool {
    label: &'static str,
    cache: Arc<StateCache>,
    loader: Arc<dyn UpdateStateLoader>,
    mem_tracker: Arc<MemTracker>,
}

pub struct IngestCoordinator {
    row: StatePool,
    column: StatePool,
    index_loader: Arc<IndexLoadExecutor>,
    index_load_wait: Duration,
}

/// Construction inputs for [`IngestCoordinator`].
pub struct StateCaches {
    pub row_cache: Arc<StateCache>,
    pub row_loader: Arc<dyn UpdateStateLoader>,
    pub row_tracker: Arc<MemTracker>,
    pub column_cache: Arc<StateCache>,
    pub column_loader: Arc<dyn UpdateStateLoader>,
    pub column_tracker: Arc<MemTracker>,
}

impl IngestCoordinator {
    pub fn new(
        caches: StateCaches,
        index_loader: Arc<IndexLoadExecutor>,
        index_load_wait: Duration,
    ) -> Self {
        Self {
            row: StatePool {
                label: "RowsetUpdateState",
                cache: caches.row_cache,
                loader: caches.row_loader,
                mem_tracker: caches.row_tracker,
            },
            column: StatePool {
                label: "RowsetColumnUpdateState",
                cache: caches.column_cache,
                loader: caches.column_loader,
                mem_tracker: caches.column_tracker,
            },
            index_loader,
            index_load_wait,
        }
    }

    fn pool_for(&self, rowset: &Rowset) -> &StatePool {
        if rowset.is_column_mode_partial_update() {
            &self.column
        } else {
            &self.row
        }
    }

    /// Preload what applying `rowset` will need.
    pub fn on_rowset_finished(&self, tablet: &Arc<dyn Tablet>, rowset: &Rowset) -> Result<()> {
        let tablet_id = tablet.tablet_id();
        if !rowset.has_data_files() || tablet.state() == TabletState::NotReady {
            return Ok(());
        }

        if rowset.is_partial_update() {
            if let Err(err) = self
                .index_loader
                .submit_task_and_wait_for(Arc::clone(tablet), self.index_load_wait)
            {
                let msg = format!(
                    "on_rowset_finished: preload primary index of tablet {tablet_id} failed: {err}"
                );
                warn!("{msg}");
                return Err(UpdateError::Uninitialized(msg));
            }
        }

        let pool = self.pool_for(rowset);
        let key = rowset_state_key(tablet_id, rowset);
        let result = self.populate(pool, tablet.as_ref(), rowset, &key);

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if tablet.state() == TabletState::Shutdown {
                    warn!(
                        tablet_id,
                        rowset_id = %rowset.rowset_id,
                        error = %err,
                        "Preload update state failed, tablet is shut down, maybe deleted by other thread"
                    );
                }
                if err.is_soft() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn populate(
        &self,
        pool: &StatePool,
        tablet: &dyn Tablet,
        rowset: &Rowset,
        key: &str,
    ) -> Result<()> {
        let guard = pool.cache.acquire(key.to_string());
        let mut state = guard.value();
        if state.is_some() {
            return Ok(());
        }
        match pool.loader.load(tablet, rowset, &pool.mem_tracker) {
            Ok(loaded) => {
                let bytes = loaded.memory_usage();
                *state = Some(loaded);
                drop(state);
                guard.set_object_size(bytes);
                debug!(kind = pool.label, key, bytes, "Preloaded update state");
                Ok(())
            }
            Err(err) => {
                drop(state);
                if err.is_soft() {
                    debug!(kind = pool.label, key, error = %err, "Skip preloading update state");
                } else {
                    warn!(kind = pool.label, key, error = %err, "Failed to preload update state");
                }
                guard.discard();
                Err(err)
            }
        }
    }

    /// Drop whatever was preloaded for `rowset`.
    pub fn on_rowset_cancel(&self, tablet: &dyn Tablet, rowset: &Rowset) {
        let pool = self.pool_for(rowset);
        let key = rowset_state_key(tablet.tablet_id(), rowset);
        if let Some(entry) = pool.cache.get(&key) {
            pool.cache.remove(&entry);
            info!(kind = pool.label, key, "Removed preloaded update state on cancel");
        }
    }

    /// Whether a populated state entry exists for `(tablet_id, rowset)`.
    pub fn test_update_state_exist(&self, tablet_id: i64, rowset: &Rowset) -> bool {
        let pool = self.pool_for(rowset);
        let key = rowset_state_key(tablet_id, rowset);
        match pool.cache.get(&key) {
            Some(entry) => {
                let populated = entry.value().is_some();
                pool.cache.release(&entry);
                populated
            }
            None => false,
        }
    }
}
