//! Dual-mode embedded persistence: an fsync'd JSON-lines write-ahead log
//! in front of DuckDB, with in-memory reads and crash recovery by replay.
//!
//! Two storage modes share one core. [`dated::DatedStorage`] gives each
//! calendar date an isolated WAL + database tree and indexes records as
//! `(key, process_name)`. [`collection::CollectionStorage`] shares one
//! global history/latest database pair across dates and indexes records
//! as `(key, collection_name, item_name)` with a type-routed scalar
//! `value`.
//!
//! A `store` call returns once its WAL line is on disk; a background
//! worker batches records into DuckDB and deletes covered segments. On
//! restart, surviving segments replay into the cache and the database, so
//! an acknowledged write is never lost.
//!
//! # Examples
//!
//! Dated mode:
//! ```no_run
//! use walstore::{DatedStorage, StorageDate, WalConfig};
//!
//! # fn main() -> walstore::Result<()> {
//! let storage = DatedStorage::open(
//!     StorageDate::parse("2025-01-15")?,
//!     "data.duckdb",
//!     WalConfig { base_dir: "./storage".into(), ..WalConfig::default() },
//! )?;
//!
//! let data = serde_json::json!({
//!     "progress": 75,
//!     "timestamp": "2025-01-15T10:30:00Z",
//! });
//! storage.store("task", data.as_object().cloned().unwrap_or_default(), Some("w1"), None, None)?;
//!
//! let processes = storage.get_key("task").expect("stored");
//! assert_eq!(processes["w1"].version, 1);
//! storage.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Collection mode with a typed value:
//! ```no_run
//! use walstore::{CollectionConfig, CollectionStorage, StorageDate};
//!
//! # fn main() -> walstore::Result<()> {
//! let storage = CollectionStorage::open(StorageDate::today(), CollectionConfig::default())?;
//! let data = serde_json::json!({"label": "Age"});
//! storage.store(
//!     "person",
//!     data.as_object().cloned().unwrap_or_default(),
//!     Some("age"),
//!     Some("info"),
//!     Some(32i64.into()),
//!     None,
//!     None,
//! )?;
//! storage.close()?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

/// Collection-mode orchestrator.
pub mod collection;
/// Configuration for both modes.
pub mod config;
/// In-memory caches and change tracking.
pub mod core;
/// Dated-mode orchestrator.
pub mod dated;
/// DuckDB gateways.
pub mod db;
/// Error and Result types.
pub mod error;
/// Single-instance lock files.
pub mod lock;
/// Record model and typed scalar values.
pub mod record;
/// Background flush worker.
pub mod runtime;
/// Extra-column schema registry.
pub mod schema;
/// Timestamp normalization and storage dates.
pub mod timestamp;
/// Shared aliases, special field names, and statistics.
pub mod types;
/// Write-ahead log segments.
pub mod wal;

pub use collection::CollectionStorage;
pub use config::{CollectionConfig, WalConfig};
pub use dated::DatedStorage;
pub use db::collection::check_database_health;
pub use error::{Result, StorageError};
pub use record::{CollectionRecord, DatedRecord, ScalarValue};
pub use timestamp::{StorageDate, TimestampSpec};
pub use types::StorageStats;
