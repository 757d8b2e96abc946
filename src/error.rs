//! Error and Result types for storage operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A convenience `Result` type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// The error type for all storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Invalid extra-column declaration (reserved name, malformed
    /// identifier, or unknown portable type).
    #[error("invalid extra schema: {0}")]
    ExtraSchema(String),

    /// Another process holds the instance lock for this storage scope.
    ///
    /// If the previous owner terminated abnormally the file is stale and
    /// must be removed manually after verifying no live process holds it.
    #[error("another instance holds the lock at {path:?}; remove the file manually if the owning process is gone")]
    InstanceLocked {
        /// Path of the contended lock file.
        path: PathBuf,
    },

    /// The database integrity probe failed on open.
    #[error("database {path:?} failed its integrity probe: {detail}. {recovery}")]
    DbCorrupt {
        /// Path of the unhealthy database file.
        path: PathBuf,
        /// Underlying probe failure.
        detail: String,
        /// Operator recovery steps for this file.
        recovery: String,
    },

    /// WAL append or fsync failed; the record was not acknowledged.
    #[error("WAL I/O failure: {0}")]
    WalIo(#[from] io::Error),

    /// A timestamp input could not be normalized.
    #[error("could not parse timestamp: {0:?}")]
    BadTimestamp(String),

    /// Parquet export was requested without a configured or supplied path.
    #[error("no parquet path provided; pass one or set it in the config")]
    ExportPathMissing,

    /// `store` was called on an instance that is closing or closed.
    #[error("storage is closed; writes are no longer accepted")]
    ReadOnly,

    /// Underlying DuckDB error.
    #[error("database error: {0}")]
    Db(#[from] duckdb::Error),

    /// Record serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
