//! Prometheus metrics for the update caches.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{Result, UpdateError};

/// Gauges and counters published by the update manager.
pub struct UpdateMetrics {
    registry: Registry,
    pub primary_index_num: IntGauge,
    pub primary_index_bytes: IntGauge,
    pub del_vector_num: IntGauge,
    pub del_vector_bytes: IntGauge,
    pub dcg_get_total: IntCounter,
    pub dcg_get_hit_cache: IntCounter,
}

impl UpdateMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let primary_index_num =
            gauge("update_primary_index_num", "Primary indexes in the index cache")?;
        let primary_index_bytes =
            gauge("update_primary_index_bytes_total", "Bytes held by the index cache")?;
        let del_vector_num = gauge("update_del_vector_num", "Cached delete vectors")?;
        let del_vector_bytes =
            gauge("update_del_vector_bytes_total", "Bytes held by cached delete vectors")?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let dcg_get_total = counter("delta_column_group_get_total", "Delta column group lookups")?;
        let dcg_get_hit_cache = counter(
            "delta_column_group_get_hit_cache",
            "Delta column group lookups served from cache",
        )?;

        Ok(Self {
            registry,
            primary_index_num,
            primary_index_bytes,
            del_vector_num,
            del_vector_bytes,
            dcg_get_total,
            dcg_get_hit_cache,
        })
    }

    /// Zero the cache gauges.
    pub fn reset_gauges(&self) {
        self.primary_index_num.set(0);
        self.primary_index_bytes.set(0);
        self.del_vector_num.set(0);
        self.del_vector_bytes.set(0);
    }

    /// Text exposition of everything registered.
    pub fn metrics_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| UpdateError::Metrics(e.to_string()))
    }
}
