//! Core data types: segment keys, delete vectors, delta column groups,
//! and the tablet/rowset descriptors handed to the ingestion hooks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

pub type TabletId = i64;

/// Identifies one segment of one tablet.
///
/// Ordering is by `(tablet_id, segment_id)`, so all segments of a tablet are
/// contiguous in an ordered map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletSegmentId {
    pub tablet_id: TabletId,
    pub segment_id: u32,
}

impl TabletSegmentId {
    pub fn new(tablet_id: TabletId, segment_id: u32) -> Self {
        Self {
            tablet_id,
            segment_id,
        }
    }

    /// Smallest key of a tablet, the start of a per-tablet range scan.
    pub fn tablet_start(tablet_id: TabletId) -> Self {
        Self::new(tablet_id, 0)
    }
}

impl std::fmt::Display for TabletSegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.tablet_id, self.segment_id)
    }
}

/// A versioned bitmap of deleted row ordinals within one segment.
///
/// Delete vectors are cumulative: version `n` contains every deletion of
/// versions `< n`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelVector {
    version: i64,
    deletes: RoaringBitmap,
}

pub type DelVectorPtr = Arc<DelVector>;

impl DelVector {
    pub fn new(version: i64, deletes: RoaringBitmap) -> Self {
        Self { version, deletes }
    }

    /// Build a delete vector from an iterator of deleted row ordinals.
    pub fn from_rows(version: i64, rows: impl IntoIterator<Item = u32>) -> Self {
        Self::new(version, rows.into_iter().collect())
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Number of deleted rows.
    pub fn cardinality(&self) -> u64 {
        self.deletes.len()
    }

    pub fn is_deleted(&self, row: u32) -> bool {
        self.deletes.contains(row)
    }

    /// Derive the next version: this vector's deletions plus `rows`.
    pub fn add_dels_as_new_version(&self, rows: &[u32], version: i64) -> DelVector {
        let mut deletes = self.deletes.clone();
        deletes.extend(rows.iter().copied());
        DelVector::new(version, deletes)
    }

    /// Approximate resident size in bytes.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.deletes.serialized_size()
    }
}

/// Column values overwritten by one column-mode partial update of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaColumnGroup {
    /// Version at which this delta became effective.
    pub version: i64,

    /// Unique column ids stored in each delta column file.
    pub column_ids: Vec<Vec<u32>>,

    /// Delta column file names, relative to the tablet directory.
    pub column_files: Vec<String>,
}

pub type DeltaColumnGroupPtr = Arc<DeltaColumnGroup>;

/// Deltas of one segment, most recent first.
pub type DeltaColumnGroupList = Vec<DeltaColumnGroupPtr>;

impl DeltaColumnGroup {
    pub fn new(version: i64, column_ids: Vec<Vec<u32>>, column_files: Vec<String>) -> Self {
        Self {
            version,
            column_ids,
            column_files,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// All column ids this delta overwrites.
    pub fn columns(&self) -> impl Iterator<Item = u32> + '_ {
        self.column_ids.iter().flatten().copied()
    }

    /// Absolute paths of this delta's column files under `dir`.
    pub fn column_file_paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.column_files.iter().map(|f| dir.join(f)).collect()
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .column_ids
                .iter()
                .map(|ids| std::mem::size_of::<Vec<u32>>() + ids.len() * std::mem::size_of::<u32>())
                .sum::<usize>()
            + self
                .column_files
                .iter()
                .map(|f| std::mem::size_of::<String>() + f.len())
                .sum::<usize>()
    }
}

/// Lifecycle state of a tablet as seen by the ingestion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    Running,
    /// Still being built by a schema change; not ready for apply.
    NotReady,
    Shutdown,
}

impl std::fmt::Display for TabletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabletState::Running => write!(f, "RUNNING"),
            TabletState::NotReady => write!(f, "NOTREADY"),
            TabletState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// A primary-key tablet as needed by the ingestion hooks.
pub trait Tablet: Send + Sync {
    fn tablet_id(&self) -> TabletId;

    fn state(&self) -> TabletState;

    /// Per-tablet primary index cache TTL; `0` uses the configured default.
    fn primary_index_cache_expire_sec(&self) -> i32 {
        0
    }
}

/// How a rowset changes existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Whole-row upserts and deletes.
    Full,
    /// Partial update rewriting full rows.
    RowPartial,
    /// Partial update writing delta column groups.
    ColumnPartial,
}

/// A finished (or cancelled) rowset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rowset {
    pub rowset_id: String,
    pub num_segments: u32,
    pub update_mode: UpdateMode,
}

impl Rowset {
    pub fn new(rowset_id: impl Into<String>, num_segments: u32, update_mode: UpdateMode) -> Self {
        Self {
            rowset_id: rowset_id.into(),
            num_segments,
            update_mode,
        }
    }

    pub fn has_data_files(&self) -> bool {
        self.num_segments > 0
    }

    pub fn is_partial_update(&self) -> bool {
        self.update_mode != UpdateMode::Full
    }

    pub fn is_column_mode_partial_update(&self) -> bool {
        self.update_mode == UpdateMode::ColumnPartial
    }
}

/// Cache key of a rowset's update state: `"<tablet_id>_<rowset_id>"`.
pub fn rowset_state_key(tablet_id: TabletId, rowset: &Rowset) -> String {
    format!("{}_{}", tablet_id, rowset.rowset_id)
}
