//! Configuration for both storage modes.

use std::collections::BTreeMap;

/// Default WAL segment size threshold (10 MiB).
pub const DEFAULT_MAX_WAL_SIZE: u64 = 10 * 1024 * 1024;
/// Default WAL segment age threshold in seconds.
pub const DEFAULT_MAX_WAL_AGE_SECONDS: u64 = 300;
/// Default pending-record count that triggers a flush.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default periodic flush cadence in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECONDS: u64 = 30;
/// Default number of calendar days kept by collection-mode retention.
pub const DEFAULT_RETAIN_DAYS: u32 = 5;

/// User-declared extra columns: column name to portable type name.
pub type ExtraSchemaDecl = BTreeMap<String, String>;

/// Configuration for dated-mode WAL behavior.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Root directory; each date owns a subdirectory beneath it.
    pub base_dir: String,
    /// Rotation size threshold in bytes for a WAL segment.
    pub max_wal_size: u64,
    /// Rotation age threshold in seconds for a WAL segment.
    pub max_wal_age_seconds: u64,
    /// Pending-record count that triggers a batch flush.
    pub batch_size: usize,
    /// Periodic background flush cadence in seconds.
    pub duckdb_flush_interval_seconds: u64,
    /// Default parquet export target; when set, `close()` exports
    /// automatically.
    pub parquet_path: Option<String>,
    /// Additional typed columns, applied at table creation only.
    pub extra_schema: ExtraSchemaDecl,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            base_dir: "./storage".to_string(),
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
            max_wal_age_seconds: DEFAULT_MAX_WAL_AGE_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            duckdb_flush_interval_seconds: DEFAULT_FLUSH_INTERVAL_SECONDS,
            parquet_path: None,
            extra_schema: ExtraSchemaDecl::new(),
        }
    }
}

/// Configuration for collection-mode storage behavior.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Root directory shared by all dates; holds the global database pair.
    pub base_dir: String,
    /// Rotation size threshold in bytes for a WAL segment.
    pub max_wal_size: u64,
    /// Pending-record count that triggers a batch flush.
    pub batch_size: usize,
    /// Periodic background flush cadence in seconds.
    pub duckdb_flush_interval_seconds: u64,
    /// Calendar days kept by the retention prune on close: today plus the
    /// previous `retain_days - 1` days.
    pub retain_days: u32,
    /// Additional typed columns, applied at table creation only.
    pub extra_schema: ExtraSchemaDecl,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            base_dir: "./collection_storage".to_string(),
            max_wal_size: DEFAULT_MAX_WAL_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            duckdb_flush_interval_seconds: DEFAULT_FLUSH_INTERVAL_SECONDS,
            retain_days: DEFAULT_RETAIN_DAYS,
            extra_schema: ExtraSchemaDecl::new(),
        }
    }
}
