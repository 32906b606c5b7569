//! Error types for recapsync.
//!
//! Library crates use [`RecapSyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all recapsync operations.
#[derive(Debug, thiserror::Error)]
pub enum RecapSyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching a page or calling a remote API.
    #[error("network error: {0}")]
    Network(String),

    /// Markup is missing a substructure the recap parser expects.
    #[error("structure error: {message}")]
    Structure { message: String },

    /// A pool worker terminated or failed outside the message protocol.
    #[error("worker error: {0}")]
    Worker(String),

    /// A worker reported a failed job through the message protocol.
    #[error("job {id} failed: {message}")]
    Job { id: String, message: String },

    /// The job was submitted to, or still pending in, a pool that is closing.
    #[error("pool shutting down")]
    PoolShutdown,

    /// A single document write to the store failed.
    #[error("store write error: {0}")]
    StoreWrite(String),

    /// Database read, query, or migration error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Location enrichment failed.
    #[error("geocode error: {0}")]
    Geocode(String),

    /// A looked-up document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed manifest, bad filter field, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RecapSyncError>;

impl RecapSyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a structure error from any displayable message.
    pub fn structure(msg: impl Into<String>) -> Self {
        Self::Structure {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the pool-less fallback parse is worth attempting after this error.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::PoolShutdown)
    }
}
