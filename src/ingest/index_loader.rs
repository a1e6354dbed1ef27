//! Primary index preload executor.
//!
//! Loads a tablet's primary index into the index cache on a background
//! thread while the submitter waits up to a bound. Concurrent submissions for
//! the same tablet share one load.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, UpdateError};
use crate::ingest::{IndexCache, PrimaryIndexLoader};
use crate::types::{Tablet, TabletId};

#[derive(Default)]
struct LoadTask {
    outcome: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl LoadTask {
    fn finish(&self, outcome: Result<()>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait_for(&self, timeout: Duration) -> Option<Result<()>> {
        let mut outcome = self.outcome.lock();
        self.done.wait_while_for(&mut outcome, |o| o.is_none(), timeout);
        outcome.clone()
    }
}

pub struct IndexLoadExecutor {
    index_cache: Arc<IndexCache>,
    loader: Arc<dyn PrimaryIndexLoader>,
    keep_bloom_filter: Arc<AtomicBool>,
    running: Mutex<HashMap<TabletId, Arc<LoadTask>>>,
    stopped: AtomicBool,
}

impl IndexLoadExecutor {
    pub fn new(
        index_cache: Arc<IndexCache>,
        loader: Arc<dyn PrimaryIndexLoader>,
        keep_bloom_filter: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index_cache,
            loader,
            keep_bloom_filter,
            running: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Make sure the primary index of `tablet` is in the index cache, waiting
    /// at most `timeout`. The load keeps running in the background after a
    /// timeout and later submitters join it.
    pub fn submit_task_and_wait_for(
        self: &Arc<Self>,
        tablet: Arc<dyn Tablet>,
        timeout: Duration,
    ) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(UpdateError::Uninitialized("index load executor is shut down".into()));
        }
        let tablet_id = tablet.tablet_id();
        let task = {
            let mut running = self.running.lock();
            if let Some(task) = running.get(&tablet_id).cloned() {
                task
            } else {
                let task = Arc::new(LoadTask::default());
                running.insert(tablet_id, Arc::clone(&task));
                let executor = Arc::clone(self);
                let spawned = std::thread::Builder::new()
                    .name(format!("pindex-load-{tablet_id}"))
                    .spawn(move || executor.run(tablet));
                if let Err(err) = spawned {
                    running.remove(&tablet_id);
                    return Err(UpdateError::Uninitialized(format!(
                        "failed to start index load for tablet {tablet_id}: {err}"
                    )));
                }
                task
            }
        };

        match task.wait_for(timeout) {
            Some(outcome) => outcome,
            None => Err(UpdateError::TimedOut(format!(
                "index load of tablet {tablet_id} not finished within {}s",
                timeout.as_secs_f64()
            ))),
        }
    }

    /// Refuse new submissions.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Number of loads in flight.
    pub fn running_tasks(&self) -> usize {
        self.running.lock().len()
    }

    fn run(&self, tablet: Arc<dyn Tablet>) {
        let tablet_id = tablet.tablet_id();
        // A panicking loader must still finish the task, or every later
        // submission for this tablet would wait on it forever.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.load(tablet.as_ref())))
            .unwrap_or_else(|payload| {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(UpdateError::Uninitialized(format!(
                    "index load of tablet {tablet_id} panicked: {reason}"
                )))
            });
        if let Err(err) = &outcome {
            warn!(tablet_id, error = %err, "Primary index preload failed");
        }
        if let Some(task) = self.running.lock().remove(&tablet_id) {
            task.finish(outcome);
        }
    }

    fn load(&self, tablet: &dyn Tablet) -> Result<()> {
        let tablet_id = tablet.tablet_id();
        let guard = self.index_cache.acquire(tablet_id);
        let expire_sec = tablet.primary_index_cache_expire_sec();
        if expire_sec > 0 {
            guard.entry().set_ttl_ms(expire_sec as i64 * 1000);
        }

        let mut slot = guard.value();
        if slot.is_some() {
            return Ok(());
        }
        let keep_bloom_filter = self.keep_bloom_filter.load(Ordering::Relaxed);
        match self.loader.load(tablet, keep_bloom_filter) {
            Ok(index) => {
                let bytes = index.memory_usage();
                *slot = Some(index);
                drop(slot);
                guard.set_object_size(bytes);
                debug!(tablet_id, bytes, "Primary index preloaded");
                Ok(())
            }
            Err(err) => {
                drop(slot);
                guard.discard();
                Err(err)
            }
        }
    }
}
