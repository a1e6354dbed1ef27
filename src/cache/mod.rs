//! Update-path caches.
//!
//! This module contains the cache data structures and algorithms:
//! - [`dynamic`]: generic refcounted cache (primary index, rowset update state)
//! - [`del_vec`]: per-segment delete vector cache
//! - [`delta_column`]: per-segment delta column group cache and its GC
//! - [`evictor`]: eviction order and watermark arithmetic

pub mod del_vec;
pub mod delta_column;
pub mod dynamic;
pub mod evictor;

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on a process-local monotonic clock.
pub fn monotonic_millis() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as i64
}
