//! pk-update-cache: standalone update cache service.
//!
//! Runs an update manager over the in-memory metadata store, drives its
//! periodic expiry and memory-pressure eviction, and serves diagnostics plus
//! the delete vector and delta column group read paths over HTTP.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use pk_update_cache::config::{Cli, Config};
use pk_update_cache::error::{Result, UpdateError};
use pk_update_cache::ingest::{PrimaryIndex, PrimaryIndexLoader, UpdateState, UpdateStateLoader};
use pk_update_cache::manager::{pretty_bytes, Collaborators, UpdateManager};
use pk_update_cache::mem_tracker::MemTracker;
use pk_update_cache::server::api::{build_router, AppState};
use pk_update_cache::store::fs::LocalFileSystem;
use pk_update_cache::store::memory::MemoryMetaStore;
use pk_update_cache::types::{Rowset, Tablet};

/// No index or state builder is linked into the standalone service; every
/// preload reports `Uninitialized` and the apply path builds on demand.
struct Unavailable;

impl PrimaryIndexLoader for Unavailable {
    fn load(&self, tablet: &dyn Tablet, _keep_bloom_filter: bool) -> Result<Arc<dyn PrimaryIndex>> {
        Err(UpdateError::Uninitialized(format!(
            "no primary index builder for tablet {}",
            tablet.tablet_id()
        )))
    }
}

impl UpdateStateLoader for Unavailable {
    fn load(
        &self,
        tablet: &dyn Tablet,
        rowset: &Rowset,
        _mem_tracker: &Arc<MemTracker>,
    ) -> Result<Box<dyn UpdateState>> {
        Err(UpdateError::Uninitialized(format!(
            "no update state builder for {}_{}",
            tablet.tablet_id(),
            rowset.rowset_id
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "pk_update_cache=debug,tower_http=debug"
    } else {
        "pk_update_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("pk-update-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Arc::new(Config::load(&cli.config)?);

    info!(
        process_mem_limit = %pretty_bytes(config.memory.process_mem_limit),
        update_mem_limit = %pretty_bytes(config.update_mem_limit()),
        expire_sec = config.cache.expire_sec,
        urgent = config.eviction.memory_urgent_level,
        high = config.eviction.memory_high_level,
        "Configuration loaded"
    );

    let process_tracker = MemTracker::root("process", config.memory.process_mem_limit);
    let loaders = Arc::new(Unavailable);
    let manager = Arc::new(UpdateManager::new(
        Arc::clone(&config),
        &process_tracker,
        Collaborators {
            index_loader: loaders.clone(),
            row_state_loader: loaders.clone(),
            column_state_loader: loaders,
            fs: Arc::new(LocalFileSystem),
        },
    )?);

    // Periodic expiry.
    let expire_mgr = Arc::clone(&manager);
    let expire_every = Duration::from_secs(config.service.expire_interval_secs.max(1));
    let expire_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(expire_every);
        loop {
            ticker.tick().await;
            expire_mgr.expire_cache();
            info!(stats = %expire_mgr.memory_stats(), "Update memory");
        }
    });

    // Memory-pressure eviction.
    let evict_mgr = Arc::clone(&manager);
    let evict_every = Duration::from_secs(config.service.evict_interval_secs.max(1));
    let (urgent, high) = (config.eviction.memory_urgent_level, config.eviction.memory_high_level);
    let evict_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(evict_every);
        loop {
            ticker.tick().await;
            evict_mgr.evict_cache(urgent, high);
        }
    });

    let store = MemoryMetaStore::shared();
    let state = Arc::new(AppState::new(Arc::clone(&manager), store));
    let app = build_router(state);

    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting update cache server");
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    expire_task.abort();
    evict_task.abort();
    manager.stop();
    Ok(())
}
