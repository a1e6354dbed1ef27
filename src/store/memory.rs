//! In-memory [`MetaStore`].
//!
//! Keeps every version of every delete vector and delta column group in
//! ordered maps. Counts reads so callers can tell cache hits from store
//! round-trips, and can be armed to fail the next call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, UpdateError};
use crate::store::{MetaStore, WriteBatch, WriteOp};
use crate::types::{DelVector, DeltaColumnGroup, DeltaColumnGroupList, TabletSegmentId};

#[derive(Debug, Default)]
struct Tables {
    del_vectors: BTreeMap<TabletSegmentId, BTreeMap<i64, DelVector>>,
    delta_column_groups: BTreeMap<TabletSegmentId, BTreeMap<i64, DeltaColumnGroup>>,
}

#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    tables: Mutex<Tables>,
    del_vector_reads: AtomicUsize,
    dcg_reads: AtomicUsize,
    injected: Mutex<Option<UpdateError>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next store call fail with `err`.
    pub fn fail_next(&self, err: UpdateError) {
        *self.injected.lock() = Some(err);
    }

    fn take_injected(&self) -> Result<()> {
        match self.injected.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of `get_del_vector` calls served so far.
    pub fn del_vector_reads(&self) -> usize {
        self.del_vector_reads.load(Ordering::Relaxed)
    }

    /// Number of `get_delta_column_group` calls served so far.
    pub fn dcg_reads(&self) -> usize {
        self.dcg_reads.load(Ordering::Relaxed)
    }

    /// Persist a delta column group directly, outside of a batch.
    pub fn put_delta_column_group(&self, tsid: TabletSegmentId, dcg: DeltaColumnGroup) {
        self.tables
            .lock()
            .delta_column_groups
            .entry(tsid)
            .or_default()
            .insert(dcg.version, dcg);
    }

    /// Versions of the delta column groups stored for `tsid`, ascending.
    pub fn delta_column_group_versions(&self, tsid: TabletSegmentId) -> Vec<i64> {
        self.tables
            .lock()
            .delta_column_groups
            .get(&tsid)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl MetaStore for MemoryMetaStore {
    fn get_del_vector(&self, tsid: TabletSegmentId, version: i64) -> Result<(DelVector, i64)> {
        self.del_vector_reads.fetch_add(1, Ordering::Relaxed);
        self.take_injected()?;

        let tables = self.tables.lock();
        let Some(versions) = tables.del_vectors.get(&tsid) else {
            return Ok((DelVector::default(), 0));
        };
        let latest = versions.keys().next_back().copied().unwrap_or(0);
        let delvec = versions
            .range(..=version)
            .next_back()
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        debug!(%tsid, version, found = delvec.version(), latest, "Loaded delete vector");
        Ok((delvec, latest))
    }

    fn set_del_vector(&self, tsid: TabletSegmentId, delvec: &DelVector) -> Result<()> {
        self.take_injected()?;
        self.tables
            .lock()
            .del_vectors
            .entry(tsid)
            .or_default()
            .insert(delvec.version(), delvec.clone());
        Ok(())
    }

    fn get_delta_column_group(
        &self,
        tsid: TabletSegmentId,
        upper_version: i64,
    ) -> Result<DeltaColumnGroupList> {
        self.dcg_reads.fetch_add(1, Ordering::Relaxed);
        self.take_injected()?;

        let tables = self.tables.lock();
        Ok(tables
            .delta_column_groups
            .get(&tsid)
            .map(|versions| {
                versions
                    .range(..=upper_version)
                    .rev()
                    .map(|(_, dcg)| Arc::new(dcg.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_delta_column_group(
        &self,
        batch: &mut WriteBatch,
        tsid: TabletSegmentId,
        version: i64,
    ) -> Result<()> {
        self.take_injected()?;
        batch.push(WriteOp::DeleteDeltaColumnGroup { tsid, version });
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.take_injected()?;
        let mut tables = self.tables.lock();
        for op in batch.into_ops() {
            match op {
                WriteOp::DeleteDeltaColumnGroup { tsid, version } => {
                    if let Some(versions) = tables.delta_column_groups.get_mut(&tsid) {
                        versions.remove(&version);
                        if versions.is_empty() {
                            tables.delta_column_groups.remove(&tsid);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
