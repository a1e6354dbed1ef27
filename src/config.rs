//! Runtime configuration for pk-update-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache-related knobs (memory budgets, TTLs, eviction watermarks) live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "pk-update-cache", about = "Primary-key update cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for diagnostics.
    #[arg(long, default_value = "0.0.0.0:8060")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Memory budget configuration.
    pub memory: MemoryConfig,

    /// Cache TTL configuration.
    pub cache: CacheConfig,

    /// Eviction watermarks.
    pub eviction: EvictionConfig,

    /// Ingestion preload settings.
    pub preload: PreloadConfig,

    /// Delta column group garbage collection.
    pub gc: GcConfig,

    /// Periodic maintenance loops of the service binary.
    pub service: ServiceConfig,
}

/// Memory budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Process memory limit in bytes.
    pub process_mem_limit: i64,

    /// Share of the process limit given to the update subsystem (0-100).
    /// Also the absolute capacity of the primary index cache.
    pub update_memory_limit_percent: i32,

    /// Share of the update limit that rowset update state may use (0-100).
    pub preload_memory_limit_percent: i32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            process_mem_limit: 8 * 1024 * 1024 * 1024, // 8 GB
            update_memory_limit_percent: 60,
            preload_memory_limit_percent: 30,
        }
    }
}

/// Cache expiry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL of released entries, and the minimum interval between expired sweeps.
    pub expire_sec: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { expire_sec: 360 }
    }
}

/// Eviction watermarks, as percentages of the index cache capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Above this level the index cache is evicted down to it immediately.
    pub memory_urgent_level: i64,

    /// Above this level the index cache is evicted in damped steps.
    pub memory_high_level: i64,

    /// Each damped step keeps at least this percentage of the current size.
    pub damping_percent: i64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            memory_urgent_level: 85,
            memory_high_level: 75,
            damping_percent: 90,
        }
    }
}

/// Ingestion preload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Upper bound on waiting for a primary index preload.
    pub index_load_wait_secs: u64,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            index_load_wait_secs: 60,
        }
    }
}

/// Delta column group GC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Longest time a GC sweep may hold the delta column group cache lock.
    pub dcg_lock_budget_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            dcg_lock_budget_ms: 10,
        }
    }
}

/// Maintenance loop intervals used by the service binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub expire_interval_secs: u64,
    pub evict_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            expire_interval_secs: 30,
            evict_interval_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject watermark and percentage combinations the eviction policy cannot honor.
    pub fn validate(&self) -> Result<()> {
        let percents = [
            ("update_memory_limit_percent", self.memory.update_memory_limit_percent as i64),
            ("preload_memory_limit_percent", self.memory.preload_memory_limit_percent as i64),
            ("memory_urgent_level", self.eviction.memory_urgent_level),
            ("memory_high_level", self.eviction.memory_high_level),
            ("damping_percent", self.eviction.damping_percent),
        ];
        for (name, value) in percents {
            if !(0..=100).contains(&value) {
                return Err(UpdateError::Config(format!(
                    "{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if self.eviction.memory_high_level > self.eviction.memory_urgent_level {
            return Err(UpdateError::Config(format!(
                "memory_high_level ({}) must not exceed memory_urgent_level ({})",
                self.eviction.memory_high_level, self.eviction.memory_urgent_level
            )));
        }
        Ok(())
    }

    /// Byte limit of the update memory root.
    pub fn update_mem_limit(&self) -> i64 {
        percent_of(self.memory.process_mem_limit, self.memory.update_memory_limit_percent as i64)
    }

    /// Byte limit of the rowset update state tracker.
    pub fn preload_mem_limit(&self) -> i64 {
        percent_of(self.update_mem_limit(), self.memory.preload_memory_limit_percent as i64)
    }

    pub fn cache_expire_ms(&self) -> i64 {
        (self.cache.expire_sec as i64).saturating_mul(1000)
    }

    pub fn index_load_wait(&self) -> Duration {
        Duration::from_secs(self.preload.index_load_wait_secs)
    }

    pub fn dcg_lock_budget(&self) -> Duration {
        Duration::from_millis(self.gc.dcg_lock_budget_ms)
    }
}

/// `value * percent / 100` with the percentage clamped to 0..=100.
pub fn percent_of(value: i64, percent: i64) -> i64 {
    let percent = percent.clamp(0, 100);
    ((value as i128) * (percent as i128) / 100) as i64
}
