//! pk-update-cache: memory-budgeted caches for primary-key table updates.
//!
//! Keeps the auxiliary structures of in-place row updates resident within a
//! shared memory budget:
//!   delete vectors, delta column groups, primary indexes, rowset update state
//!
//! [`manager::UpdateManager`] owns all of them; the persistent metadata store,
//! the filesystem and the index/state builders are supplied by the caller.

pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod manager;
pub mod mem_tracker;
pub mod metrics;
pub mod reader;
pub mod server;
pub mod store;
pub mod types;

pub use error::{Result, UpdateError};
pub use manager::{Collaborators, UpdateManager};
