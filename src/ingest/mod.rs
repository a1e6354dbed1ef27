//! Ingestion lifecycle: preloading apply state when a rowset finishes.
//!
//! - [`index_loader`]: primary index preload executor with a bounded wait
//! - [`coordinator`]: `on_rowset_finished` / `on_rowset_cancel`
//!
//! The primary index and the rowset update state are opaque here; they are
//! produced by the loaders passed in and only held, sized and evicted.

pub mod coordinator;
pub mod index_loader;

use std::sync::Arc;

use crate::cache::dynamic::DynamicCache;
use crate::error::Result;
use crate::mem_tracker::MemTracker;
use crate::types::{Rowset, Tablet, TabletId};

/// A loaded primary-key index.
pub trait PrimaryIndex: Send + Sync {
    fn memory_usage(&self) -> usize;
}

/// Builds a tablet's primary index.
pub trait PrimaryIndexLoader: Send + Sync {
    /// `keep_bloom_filter` is false while the index cache is above its high
    /// watermark; loaders should skip the auxiliary lookup filter then.
    fn load(&self, tablet: &dyn Tablet, keep_bloom_filter: bool) -> Result<Arc<dyn PrimaryIndex>>;
}

/// State needed to apply one rowset into the primary index.
pub trait UpdateState: Send + Sync {
    fn memory_usage(&self) -> usize;
}

/// Materializes the update state of a finished rowset.
pub trait UpdateStateLoader: Send + Sync {
    /// `mem_tracker` is the pool the state is accounted against; loaders
    /// should fail with `MemoryLimitExceeded` rather than overrun its limit.
    fn load(
        &self,
        tablet: &dyn Tablet,
        rowset: &Rowset,
        mem_tracker: &Arc<MemTracker>,
    ) -> Result<Box<dyn UpdateState>>;
}

/// Primary index cache, keyed by tablet id.
pub type IndexCache = DynamicCache<TabletId, Option<Arc<dyn PrimaryIndex>>>;

/// Rowset update state cache, keyed by `"<tablet_id>_<rowset_id>"`.
pub type StateCache = DynamicCache<String, Option<Box<dyn UpdateState>>>;
