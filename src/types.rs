//! Shared primitive aliases, special field names, and statistics.

use serde::{Deserialize, Serialize};

/// Monotonic WAL segment sequence number.
pub type WalSeq = u64;
/// Monotonic per-identity record version.
pub type Version = i64;

/// Dictionary keys with storage-level meaning.
///
/// Values under these keys are lifted out of `data` into typed columns
/// (the `data` blob itself keeps them). The same names participate in the
/// reserved-column check applied to extra-schema declarations.
pub mod keys {
    /// Process identity field (dated mode).
    pub const PROCESS_NAME: &str = "process_name";
    /// Record timestamp field.
    pub const TIMESTAMP: &str = "timestamp";
    /// Status text field.
    pub const STATUS: &str = "status";
    /// Numeric status field.
    pub const STATUS_INT: &str = "status_int";
    /// Username field.
    pub const USERNAME: &str = "username";
}

/// Point-in-time storage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Number of top-level keys resident in the cache.
    pub cache_size: usize,
    /// Number of records staged for the next database flush.
    pub pending_writes: usize,
    /// Identities modified since the last latest-table materialization.
    /// Always zero in dated mode.
    pub modified_records: usize,
    /// Bytes appended to the currently open WAL segment.
    pub current_wal_size: u64,
    /// Records appended to the currently open WAL segment.
    pub current_wal_count: usize,
    /// WAL segment files currently on disk.
    pub wal_files_count: usize,
    /// Sequence number of the current WAL segment (0 before the first append).
    pub wal_sequence: WalSeq,
}
