//! Hierarchical memory accounting.
//!
//! Every tracker is a node in a tree of atomic counters. `consume`/`release`
//! update the node and walk up to the root, so a single monitor reading the
//! root sees aggregate consumption. Updates are commutative, so no lock spans
//! the tree.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A node in the memory accounting tree.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    /// Hard limit in bytes, or -1 for unbounded.
    limit: i64,
    consumption: AtomicI64,
    peak: AtomicI64,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    /// Create a root tracker. A negative `limit` means unbounded.
    pub fn root(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self::build(label.into(), limit, None))
    }

    /// Create a child of `parent`. A negative `limit` means unbounded.
    pub fn child(label: impl Into<String>, limit: i64, parent: &Arc<MemTracker>) -> Arc<Self> {
        Arc::new(Self::build(label.into(), limit, Some(Arc::clone(parent))))
    }

    fn build(label: String, limit: i64, parent: Option<Arc<MemTracker>>) -> Self {
        Self {
            label,
            limit: if limit < 0 { -1 } else { limit },
            consumption: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            parent,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Add `bytes` to this tracker and all ancestors. Negative values release.
    pub fn consume(&self, bytes: i64) {
        if bytes < 0 {
            self.release(-bytes);
            return;
        }
        if bytes == 0 {
            return;
        }
        let mut node = Some(self);
        while let Some(tracker) = node {
            let now = tracker.consumption.fetch_add(bytes, Ordering::Relaxed) + bytes;
            tracker.peak.fetch_max(now, Ordering::Relaxed);
            node = tracker.parent.as_deref();
        }
    }

    /// Subtract `bytes` from this tracker and all ancestors, clamping each at zero.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut node = Some(self);
        while let Some(tracker) = node {
            // The closure always returns Some, so the update cannot fail.
            let _ = tracker
                .consumption
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                    Some(cur.saturating_sub(bytes).max(0))
                });
            node = tracker.parent.as_deref();
        }
    }

    /// Current consumption in bytes (never negative).
    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed).max(0)
    }

    pub fn peak_consumption(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Configured limit in bytes, `None` when unbounded.
    pub fn limit(&self) -> Option<i64> {
        (self.limit >= 0).then_some(self.limit)
    }

    /// Bytes left before this tracker's own limit, `None` when unbounded.
    pub fn remaining(&self) -> Option<i64> {
        self.limit().map(|limit| (limit - self.consumption()).max(0))
    }

    /// Whether this tracker or any limited ancestor is already over its limit.
    pub fn limit_exceeded(&self) -> bool {
        self.any_limit(|tracker, limit| tracker.consumption() > limit)
    }

    /// Whether consuming `bytes` more would push this tracker or an ancestor over its limit.
    /// Enforcement is left to callers; the tracker never rejects a `consume`.
    pub fn would_exceed_limit(&self, bytes: i64) -> bool {
        self.any_limit(|tracker, limit| tracker.consumption().saturating_add(bytes) > limit)
    }

    fn any_limit(&self, pred: impl Fn(&MemTracker, i64) -> bool) -> bool {
        let mut node = Some(self);
        while let Some(tracker) = node {
            if let Some(limit) = tracker.limit() {
                if pred(tracker, limit) {
                    return true;
                }
            }
            node = tracker.parent.as_deref();
        }
        false
    }
}
