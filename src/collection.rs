//! Collection-mode storage: one global history/latest database pair
//! shared across dates; dates organize WAL directories and backups only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::NaiveDate;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as Json};
use tracing::{error, info, warn};

use crate::config::CollectionConfig;
use crate::core::cache::CollectionCache;
use crate::core::tracker::ChangeTracker;
use crate::db::collection::{check_database_health, CollectionDb};
use crate::error::{Result, StorageError};
use crate::lock::InstanceLock;
use crate::record::{CollectionRecord, ScalarValue};
use crate::runtime::flusher::{CycleOutcome, FlushWorker};
use crate::schema::{ExtraSchema, COLLECTION_RESERVED};
use crate::timestamp::{StorageDate, TimestampSpec};
use crate::types::{StorageStats, Version};
use crate::wal::recovery;
use crate::wal::writer::{list_segments, WalWriter};

/// State guarded by the write lock.
struct CollectionState {
    cache: CollectionCache,
    pending: Vec<CollectionRecord>,
    wal: WalWriter,
    tracker: ChangeTracker,
}

struct CollectionInner {
    config: CollectionConfig,
    date: StorageDate,
    base_dir: PathBuf,
    wal_dir: PathBuf,
    schema: ExtraSchema,
    /// The write lock.
    state: RwLock<CollectionState>,
    /// The flush lock: spans one whole cycle so concurrent flush requests
    /// drain and commit in order.
    flush_gate: Mutex<()>,
    /// Connection guard; `None` once the instance has closed.
    db: Mutex<Option<CollectionDb>>,
    /// Held for the instance lifetime; dropped on close.
    instance_lock: Mutex<Option<InstanceLock>>,
}

/// Collection/item storage with a dual-table database: `storage_history`
/// keeps every version, `storage_latest` keeps one row per identity and
/// feeds lazy collection loads.
///
/// # Examples
///
/// ```no_run
/// use walstore::{CollectionConfig, CollectionStorage, StorageDate};
///
/// # fn main() -> walstore::Result<()> {
/// let storage = CollectionStorage::open(StorageDate::today(), CollectionConfig::default())?;
///
/// let data = serde_json::json!({"label": "Age"});
/// storage.store(
///     "person",
///     data.as_object().cloned().unwrap_or_default(),
///     Some("age"),
///     Some("info"),
///     Some(32i64.into()),
///     None,
///     None,
/// )?;
///
/// let record = storage.get_item("person", "info", "age")?;
/// assert!(record.is_some());
/// storage.close()?;
/// # Ok(())
/// # }
/// ```
pub struct CollectionStorage {
    inner: Arc<CollectionInner>,
    worker: Mutex<Option<FlushWorker>>,
    closed: AtomicBool,
}

impl CollectionStorage {
    /// Opens the global storage, scoped to `date` for WAL files, backups,
    /// and the instance lock.
    pub fn open(date: impl Into<StorageDate>, config: CollectionConfig) -> Result<Self> {
        let date = date.into();
        let date_str = date.to_string();
        let schema = ExtraSchema::new(&config.extra_schema, COLLECTION_RESERVED)?;

        let base_dir = PathBuf::from(&config.base_dir);
        let wal_dir = base_dir.join(&date_str);
        fs::create_dir_all(&wal_dir)?;

        let instance_lock = InstanceLock::acquire(&base_dir.join(format!(".lock_{date_str}")))?;

        let history_path = base_dir.join("storage_history.duckdb");
        let latest_path = base_dir.join("storage_latest.duckdb");
        let db = CollectionDb::open(&history_path, &latest_path, &schema)?;

        // No startup scan: collections load lazily. Unprocessed WAL
        // segments from a crashed run replay into the cache and stage as
        // the first pending batch.
        let recovered: Vec<CollectionRecord> = recovery::replay(&wal_dir)?;
        let mut cache = CollectionCache::new();
        let mut tracker = ChangeTracker::new();
        let mut pending = Vec::with_capacity(recovered.len());
        for record in &recovered {
            tracker.record(record.identity());
            cache.insert(record.clone());
        }
        pending.extend(recovered);

        let wal = WalWriter::open(&wal_dir)?;
        let interval = Duration::from_secs(config.duckdb_flush_interval_seconds);

        let inner = Arc::new(CollectionInner {
            config,
            date,
            base_dir,
            wal_dir,
            schema,
            state: RwLock::new(CollectionState {
                cache,
                pending,
                wal,
                tracker,
            }),
            flush_gate: Mutex::new(()),
            db: Mutex::new(Some(db)),
            instance_lock: Mutex::new(Some(instance_lock)),
        });

        if !inner.state.read().pending.is_empty() {
            inner.flush_cycle()?;
            info!("flushed recovered records to history database");
        }

        let weak: Weak<CollectionInner> = Arc::downgrade(&inner);
        let worker = FlushWorker::spawn(interval, move || match weak.upgrade() {
            Some(inner) => inner.flush_cycle(),
            None => Ok(CycleOutcome::Detached),
        });

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Stores one record durably and tracks its identity for the next
    /// latest-table materialization.
    ///
    /// `value` routes by runtime type into `value_int` / `value_float` /
    /// `value_string`; at most one is non-null per row.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        key: &str,
        data: Map<String, Json>,
        item_name: Option<&str>,
        collection_name: Option<&str>,
        value: Option<ScalarValue>,
        timestamp: Option<TimestampSpec>,
        username: Option<&str>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        let collection_name = collection_name.unwrap_or_default();
        let item_name = item_name.unwrap_or_default();

        let notify = {
            let mut state = self.inner.state.write();
            self.inner.ensure_loaded(&mut state, key, collection_name)?;

            let version: Version = state.cache.version_of(key, collection_name, item_name) + 1;
            let record = CollectionRecord::build(
                key,
                data,
                Some(item_name.to_string()),
                Some(collection_name.to_string()),
                value,
                timestamp,
                username.map(str::to_string),
                version,
                &self.inner.schema,
            )?;

            // Durability barrier: cache publish only after the fsync.
            state.wal.append(&record)?;
            state.tracker.record(record.identity());
            state.cache.insert(record.clone());
            state.pending.push(record);

            let over = state
                .wal
                .over_threshold(self.inner.config.max_wal_size, None);
            if over {
                state.wal.rotate()?;
            }
            over || state.pending.len() >= self.inner.config.batch_size
        };

        if notify {
            self.notify_worker();
        }
        Ok(())
    }

    /// All collections for a key, or the items of one collection when
    /// `collection_name` is given (triggering a lazy load for it).
    pub fn get_key(
        &self,
        key: &str,
        collection_name: Option<&str>,
    ) -> Result<Option<HashMap<String, HashMap<String, CollectionRecord>>>> {
        let mut state = self.inner.state.write();
        if let Some(collection_name) = collection_name {
            self.inner.ensure_loaded(&mut state, key, collection_name)?;
            let Some(items) = state.cache.get_collection(key, collection_name) else {
                return Ok(None);
            };
            if items.is_empty() {
                return Ok(None);
            }
            let mut restricted = HashMap::new();
            restricted.insert(collection_name.to_string(), items.clone());
            return Ok(Some(restricted));
        }
        Ok(state.cache.get_key(key).cloned())
    }

    /// A single record by identity triple, lazily loading its collection.
    pub fn get_item(
        &self,
        key: &str,
        collection_name: &str,
        item_name: &str,
    ) -> Result<Option<CollectionRecord>> {
        let mut state = self.inner.state.write();
        self.inner.ensure_loaded(&mut state, key, collection_name)?;
        Ok(state
            .cache
            .get_item(key, collection_name, item_name)
            .cloned())
    }

    /// Whether a database file is absent or healthy. Pass the live
    /// connection when probing a file this instance already holds open.
    pub fn check_database_health(
        &self,
        path: &Path,
        table: &str,
        conn: Option<&duckdb::Connection>,
    ) -> bool {
        check_database_health(path, table, conn)
    }

    /// Rotates the current segment and drains everything pending into the
    /// history table synchronously.
    pub fn flush_data_to_duckdb(&self) -> Result<()> {
        self.inner.flush_cycle()?;
        Ok(())
    }

    /// Reconstructs history rows from the WAL segments of one date
    /// directory. Returns the number of records recovered. Idempotent:
    /// rows are keyed by identity and version.
    pub fn rebuild_history_from_wal(&self, date: impl Into<StorageDate>) -> Result<usize> {
        let date_str = date.into().to_string();
        let wal_dir = self.inner.base_dir.join(&date_str);
        let records: Vec<CollectionRecord> = recovery::replay(&wal_dir)?;
        if records.is_empty() {
            warn!(date = %date_str, "no WAL records found to rebuild from");
            return Ok(0);
        }

        {
            let mut db = self.inner.db.lock();
            let Some(db) = db.as_mut() else {
                return Err(StorageError::ReadOnly);
            };
            db.append_history(&records)?;
        }

        let mut state = self.inner.state.write();
        let count = records.len();
        for record in records {
            state.cache.insert(record);
        }
        info!(records = count, date = %date_str, "rebuilt history from WAL");
        Ok(count)
    }

    /// Rebuilds the latest table from the newest history version of every
    /// identity and refreshes the cache. Returns the number of rows.
    pub fn rebuild_latest_from_history(&self) -> Result<usize> {
        let records = {
            let mut db = self.inner.db.lock();
            let Some(db) = db.as_mut() else {
                return Err(StorageError::ReadOnly);
            };
            db.rebuild_latest_from_history()?
        };

        let mut state = self.inner.state.write();
        let count = records.len();
        for record in records {
            state
                .cache
                .mark_loaded(&record.key, &record.collection_name);
            state.cache.insert(record);
        }
        Ok(count)
    }

    /// Point-in-time statistics.
    pub fn get_stats(&self) -> StorageStats {
        let state = self.inner.state.read();
        let wal_files_count = list_segments(&self.inner.wal_dir)
            .map(|segments| segments.len())
            .unwrap_or(0);
        StorageStats {
            cache_size: state.cache.len(),
            pending_writes: state.pending.len(),
            modified_records: state.tracker.len(),
            current_wal_size: state.wal.current_size(),
            current_wal_count: state.wal.current_count(),
            wal_files_count,
            wal_sequence: state.wal.sequence(),
        }
    }

    /// Flushes to quiescence, materializes the latest table, snapshots
    /// both database files into the date directory, prunes directories
    /// beyond retention, and releases the instance lock.
    ///
    /// Idempotent: later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("shutting down collection storage");

        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }

        self.inner.flush_cycle()?;
        self.inner.materialize_latest()?;

        self.inner.state.write().wal.seal()?;
        for (_, path) in list_segments(&self.inner.wal_dir)? {
            if let Err(err) = fs::remove_file(&path) {
                error!(segment = %path.display(), %err, "could not delete WAL segment on close");
            }
        }

        // Connections must be gone before the byte-for-byte snapshot.
        let paths = self
            .inner
            .db
            .lock()
            .take()
            .map(|db| (db.paths().0.to_path_buf(), db.paths().1.to_path_buf()));
        if let Some((history_path, latest_path)) = paths {
            self.inner.backup_databases(&history_path, &latest_path);
        }

        self.inner.prune_old_date_dirs();
        self.inner.instance_lock.lock().take();
        info!("collection storage shut down");
        Ok(())
    }

    fn notify_worker(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.signal().notify();
        }
    }
}

impl Drop for CollectionStorage {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(%err, "error during collection storage shutdown");
        }
    }
}

impl CollectionInner {
    /// Materializes a collection from the latest table on first touch.
    /// Identities already cached win: they are newer than the table.
    fn ensure_loaded(
        &self,
        state: &mut CollectionState,
        key: &str,
        collection_name: &str,
    ) -> Result<()> {
        if state.cache.is_loaded(key, collection_name) {
            return Ok(());
        }
        let rows = {
            let db = self.db.lock();
            let Some(db) = db.as_ref() else {
                return Err(StorageError::ReadOnly);
            };
            db.load_collection(key, collection_name)?
        };
        let loaded = rows.len();
        for record in rows {
            if state
                .cache
                .get_item(&record.key, &record.collection_name, &record.item_name)
                .is_none()
            {
                state.cache.insert(record);
            }
        }
        state.cache.mark_loaded(key, collection_name);
        if loaded > 0 {
            info!(key, collection = collection_name, items = loaded, "loaded collection");
        }
        Ok(())
    }

    /// One flush cycle into the history table; see the dated counterpart
    /// for the seal/drain/delete protocol.
    fn flush_cycle(&self) -> Result<CycleOutcome> {
        let _gate = self.flush_gate.lock();
        // The covered segment set is captured in the same critical section
        // that drains the batch: the freshly sealed segments hold exactly
        // the drained records. A later rotation by a concurrent store must
        // not widen it.
        let (batch, covered) = {
            let mut state = self.state.write();
            if state.pending.is_empty() {
                return Ok(CycleOutcome::Idle);
            }
            if state.wal.has_open_segment() {
                state.wal.seal()?;
            }
            let covered = state.wal.sealed_segments()?;
            (std::mem::take(&mut state.pending), covered)
        };

        // Lock order is write_lock → db everywhere; the db guard ends
        // before the failure path re-enters the write lock.
        let appended = {
            let mut db = self.db.lock();
            let Some(db) = db.as_mut() else {
                return Ok(CycleOutcome::Detached);
            };
            db.append_history(&batch)
        };
        if let Err(err) = appended {
            let mut state = self.state.write();
            let newer = std::mem::take(&mut state.pending);
            state.pending = batch;
            state.pending.extend(newer);
            return Err(err);
        }

        let flushed = batch.len();
        for path in covered {
            match fs::remove_file(&path) {
                Ok(()) => info!(segment = %path.display(), "deleted processed WAL segment"),
                Err(err) => warn!(segment = %path.display(), %err, "could not delete WAL segment"),
            }
        }
        Ok(CycleOutcome::Flushed(flushed))
    }

    /// Upserts every identity modified this session into the latest
    /// table; the tracker clears only after the commit.
    fn materialize_latest(&self) -> Result<usize> {
        let _gate = self.flush_gate.lock();
        let records: Vec<CollectionRecord> = {
            let state = self.state.read();
            state
                .tracker
                .snapshot()
                .into_iter()
                .filter_map(|(key, collection, item)| {
                    state.cache.get_item(&key, &collection, &item).cloned()
                })
                .collect()
        };
        if records.is_empty() {
            return Ok(0);
        }

        {
            let mut db = self.db.lock();
            let Some(db) = db.as_mut() else {
                return Ok(0);
            };
            db.upsert_latest(&records)?;
        }

        self.state.write().tracker.clear();
        Ok(records.len())
    }

    /// Copies both database files into the date directory.
    fn backup_databases(&self, history_path: &Path, latest_path: &Path) {
        for source in [history_path, latest_path] {
            if !source.exists() {
                continue;
            }
            let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let target = self.wal_dir.join(format!("{name}.backup"));
            match fs::copy(source, &target) {
                Ok(_) => info!(backup = %target.display(), "backed up database"),
                Err(err) => error!(source = %source.display(), %err, "database backup failed"),
            }
        }
    }

    /// Removes date-named sibling directories older than the retention
    /// window: the instance date plus the previous `retain_days - 1` days
    /// survive.
    fn prune_old_date_dirs(&self) {
        let retain = u64::from(self.config.retain_days.saturating_sub(1));
        let cutoff = self.date.date() - chrono::Days::new(retain);

        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!(%err, "could not enumerate date directories for retention");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_date) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if dir_date < cutoff {
                match fs::remove_dir_all(&path) {
                    Ok(()) => info!(dir = %path.display(), "deleted date directory past retention"),
                    Err(err) => error!(dir = %path.display(), %err, "could not delete date directory"),
                }
            }
        }
    }
}
