//! Error taxonomy for the update cache core.

use thiserror::Error;

/// Errors surfaced by the caches, the metadata store and the ingestion hooks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// Metadata store or filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    /// A published value went backwards. Indicates an upstream sequencing bug.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A preload task failed to start or complete.
    #[error("Uninitialized: {0}")]
    Uninitialized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl UpdateError {
    pub fn is_mem_limit_exceeded(&self) -> bool {
        matches!(self, UpdateError::MemoryLimitExceeded(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, UpdateError::TimedOut(_))
    }

    /// Failures that opportunistic preloading absorbs: the apply path rebuilds
    /// the state on a cache miss anyway.
    pub fn is_soft(&self) -> bool {
        self.is_mem_limit_exceeded() || self.is_timed_out()
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => UpdateError::TimedOut(err.to_string()),
            std::io::ErrorKind::NotFound => UpdateError::NotFound(err.to_string()),
            _ => UpdateError::Io(err.to_string()),
        }
    }
}

impl From<prometheus::Error> for UpdateError {
    fn from(err: prometheus::Error) -> Self {
        UpdateError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
