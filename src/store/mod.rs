//! Collaborators behind the caches: the persistent metadata store and the
//! filesystem holding delta column files.
//!
//! - [`memory`]: in-memory [`MetaStore`] used by the service binary and tests
//! - [`fs`]: [`FileSystem`] backed by the local disk

pub mod fs;
pub mod memory;

use std::path::Path;

use crate::error::Result;
use crate::types::{DelVector, DeltaColumnGroupList, TabletSegmentId};

/// A single mutation staged in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    DeleteDeltaColumnGroup {
        tsid: TabletSegmentId,
        version: i64,
    },
}

/// Mutations applied atomically by [`MetaStore::write_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Persistent tablet metadata (delete vectors and delta column groups).
pub trait MetaStore: Send + Sync {
    /// Load the newest delete vector with version `<= version`, together with
    /// the latest version stored for the segment. A segment without any
    /// delete vector yields an empty vector of version 0.
    fn get_del_vector(&self, tsid: TabletSegmentId, version: i64) -> Result<(DelVector, i64)>;

    fn set_del_vector(&self, tsid: TabletSegmentId, delvec: &DelVector) -> Result<()>;

    /// All delta column groups with version `<= upper_version`, most recent first.
    fn get_delta_column_group(
        &self,
        tsid: TabletSegmentId,
        upper_version: i64,
    ) -> Result<DeltaColumnGroupList>;

    /// Stage the deletion of one delta column group into `batch`.
    fn delete_delta_column_group(
        &self,
        batch: &mut WriteBatch,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<()>;

    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// Filesystem operations needed to drop obsolete delta column files.
pub trait FileSystem: Send + Sync {
    fn delete_file(&self, path: &Path) -> Result<()>;
}
