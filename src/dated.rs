//! Dated-mode storage: one isolated WAL + database tree per calendar date.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as Json};
use tracing::{error, info, warn};

use crate::config::WalConfig;
use crate::core::cache::DatedCache;
use crate::db::dated::DatedDb;
use crate::error::{Result, StorageError};
use crate::lock::InstanceLock;
use crate::record::DatedRecord;
use crate::runtime::flusher::{CycleOutcome, FlushWorker};
use crate::schema::{ExtraSchema, DATED_RESERVED};
use crate::timestamp::{StorageDate, TimestampSpec};
use crate::types::{keys, StorageStats};
use crate::wal::recovery;
use crate::wal::writer::{list_segments, WalWriter};

/// State guarded by the write lock: every mutation of the cache, the
/// pending batch, and the WAL goes through one critical section, and the
/// WAL fsync completes inside it.
struct DatedState {
    cache: DatedCache,
    pending: Vec<DatedRecord>,
    wal: WalWriter,
}

struct DatedInner {
    config: WalConfig,
    date_str: String,
    wal_dir: PathBuf,
    schema: ExtraSchema,
    /// The write lock.
    state: RwLock<DatedState>,
    /// The flush lock: spans one whole cycle so concurrent flush requests
    /// drain and commit in order.
    flush_gate: Mutex<()>,
    /// Connection guard; `None` once the instance has closed.
    db: Mutex<Option<DatedDb>>,
    /// Held for the instance lifetime; dropped on close.
    instance_lock: Mutex<Option<InstanceLock>>,
}

/// Date-scoped storage: fsync'd WAL writes, in-memory reads, batched
/// DuckDB persistence, and crash recovery by WAL replay.
///
/// # Examples
///
/// ```no_run
/// use walstore::{DatedStorage, StorageDate, WalConfig};
///
/// # fn main() -> walstore::Result<()> {
/// let storage = DatedStorage::open(
///     StorageDate::parse("2025-01-15")?,
///     "data.duckdb",
///     WalConfig::default(),
/// )?;
///
/// let data = serde_json::json!({"progress": 75, "status": "running"});
/// storage.store("task", data.as_object().cloned().unwrap_or_default(), Some("w1"), None, None)?;
///
/// let record = storage.get_key_process("task", Some("w1"));
/// assert!(record.is_some());
/// storage.close()?;
/// # Ok(())
/// # }
/// ```
pub struct DatedStorage {
    inner: Arc<DatedInner>,
    worker: Mutex<Option<FlushWorker>>,
    closed: AtomicBool,
}

impl DatedStorage {
    /// Opens (or creates) the storage tree for one date.
    ///
    /// A relative `db_path` keeps only its file name and lands inside the
    /// date directory. An absolute `db_path` is used verbatim — that
    /// escapes date isolation and lets multiple dates share one file, so
    /// treat it as a deliberate choice.
    pub fn open(
        date: impl Into<StorageDate>,
        db_path: impl AsRef<Path>,
        config: WalConfig,
    ) -> Result<Self> {
        let date_str = date.into().to_string();
        let schema = ExtraSchema::new(&config.extra_schema, DATED_RESERVED)?;

        let wal_dir = Path::new(&config.base_dir).join(&date_str);
        fs::create_dir_all(&wal_dir)?;

        let db_path = resolve_db_path(&wal_dir, db_path.as_ref());
        let instance_lock = InstanceLock::acquire(&wal_dir.join(".lock"))?;

        let db = DatedDb::open(&db_path, &schema)?;
        let mut cache = DatedCache::new();
        for record in db.scan_all()? {
            cache.insert(record);
        }
        info!(
            records = cache.total_records(),
            keys = cache.len(),
            "loaded records from database"
        );

        // Crash recovery: unprocessed segments replay into the cache and
        // stage as the first pending batch, last writer wins per identity.
        let recovered: Vec<DatedRecord> = recovery::replay(&wal_dir)?;
        let mut pending = Vec::with_capacity(recovered.len());
        for record in &recovered {
            cache.insert(record.clone());
        }
        pending.extend(recovered);

        let wal = WalWriter::open(&wal_dir)?;
        let interval = Duration::from_secs(config.duckdb_flush_interval_seconds);

        let inner = Arc::new(DatedInner {
            config,
            date_str,
            wal_dir,
            schema,
            state: RwLock::new(DatedState {
                cache,
                pending,
                wal,
            }),
            flush_gate: Mutex::new(()),
            db: Mutex::new(Some(db)),
            instance_lock: Mutex::new(Some(instance_lock)),
        });

        if !inner.state.read().pending.is_empty() {
            inner.flush_cycle()?;
            info!("flushed recovered records to database");
        }

        let weak: Weak<DatedInner> = Arc::downgrade(&inner);
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

    /// Stores one record durably.
    ///
    /// Returns once the WAL line has been written and fsynced; the
    /// database upsert happens in the background. Special fields follow
    /// the parameter > `data` field > default precedence and stay in the
    /// blob after lifting.
    pub fn store(
        &self,
        key: &str,
        data: Map<String, Json>,
        process_name: Option<&str>,
        timestamp: Option<TimestampSpec>,
        username: Option<&str>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }

        let process_name = process_name
            .map(str::to_string)
            .or_else(|| {
                data.get(keys::PROCESS_NAME)
                    .and_then(Json::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let rotate_needed = {
            let mut state = self.inner.state.write();
            let version = state.cache.version_of(key, &process_name) + 1;
            let record = DatedRecord::build(
                key,
                data,
                Some(process_name),
                timestamp,
                username.map(str::to_string),
                version,
                &self.inner.schema,
            )?;

            // Durability barrier: cache publish only after the fsync.
            state.wal.append(&record)?;
            state.cache.insert(record.clone());
            state.pending.push(record);

            let over = state.wal.over_threshold(
                self.inner.config.max_wal_size,
                Some(Duration::from_secs(self.inner.config.max_wal_age_seconds)),
            );
            if over {
                state.wal.rotate()?;
            }
            over || state.pending.len() >= self.inner.config.batch_size
        };

        if rotate_needed {
            self.notify_worker();
        }
        Ok(())
    }

    /// All process entries for a key, or `None` when unknown.
    pub fn get_key(&self, key: &str) -> Option<HashMap<String, DatedRecord>> {
        self.inner.state.read().cache.get_key(key).cloned()
    }

    /// A single record by `(key, process_name)`; `None` process means the
    /// unspecified sentinel.
    pub fn get_key_process(&self, key: &str, process_name: Option<&str>) -> Option<DatedRecord> {
        self.inner
            .state
            .read()
            .cache
            .get(key, process_name.unwrap_or_default())
            .cloned()
    }

    /// Rotates the current segment and drains everything pending into the
    /// database synchronously.
    pub fn flush_data_to_duckdb(&self) -> Result<()> {
        self.inner.flush_cycle()?;
        Ok(())
    }

    /// Exports the whole table as Hive-partitioned parquet.
    ///
    /// Uses `path`, falling back to the configured `parquet_path`;
    /// neither present fails with [`StorageError::ExportPathMissing`].
    /// Returns `None` when there is no data to export.
    pub fn export_to_parquet(&self, path: Option<&str>) -> Result<Option<PathBuf>> {
        let target = path
            .map(str::to_string)
            .or_else(|| self.inner.config.parquet_path.clone())
            .ok_or(StorageError::ExportPathMissing)?;

        self.inner.flush_cycle()?;
        let mut db = self.inner.db.lock();
        let Some(db) = db.as_mut() else {
            return Err(StorageError::ReadOnly);
        };
        let target = PathBuf::from(target);
        match db.export_parquet(&target, &self.inner.date_str)? {
            0 => {
                warn!("no data to export to parquet");
                Ok(None)
            }
            _ => Ok(Some(target)),
        }
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
            modified_records: 0,
            current_wal_size: state.wal.current_size(),
            current_wal_count: state.wal.current_count(),
            wal_files_count,
            wal_sequence: state.wal.sequence(),
        }
    }

    /// Flushes to quiescence, optionally exports parquet, removes
    /// processed WAL segments, and releases the instance lock.
    ///
    /// Idempotent: later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("shutting down dated storage");

        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }

        self.inner.flush_cycle()?;

        if self.inner.config.parquet_path.is_some() {
            if let Err(err) = self.export_on_close() {
                error!(%err, "parquet export failed on close");
            }
        }

        // Everything is in the database now; the WAL has served its purpose.
        self.inner.state.write().wal.seal()?;
        for (_, path) in list_segments(&self.inner.wal_dir)? {
            if let Err(err) = fs::remove_file(&path) {
                error!(segment = %path.display(), %err, "could not delete WAL segment on close");
            }
        }

        self.inner.db.lock().take();
        self.inner.instance_lock.lock().take();
        info!("dated storage shut down");
        Ok(())
    }

    fn export_on_close(&self) -> Result<()> {
        let mut db = self.inner.db.lock();
        let Some(db) = db.as_mut() else {
            return Ok(());
        };
        if let Some(path) = &self.inner.config.parquet_path {
            db.export_parquet(Path::new(path), &self.inner.date_str)?;
        }
        Ok(())
    }

    fn notify_worker(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.signal().notify();
        }
    }
}

impl Drop for DatedStorage {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(%err, "error during dated storage shutdown");
        }
    }
}

impl DatedInner {
    /// One flush cycle: seal the WAL, drain the pending batch, upsert it
    /// atomically, then delete the covered segments. On upsert failure
    /// the batch is restored in order and the segments stay.
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
        let upserted = {
            let mut db = self.db.lock();
            let Some(db) = db.as_mut() else {
                return Ok(CycleOutcome::Detached);
            };
            db.upsert_batch(&batch)
        };
        if let Err(err) = upserted {
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
                // Harmless: the next cycle re-replays idempotently.
                Err(err) => warn!(segment = %path.display(), %err, "could not delete WAL segment"),
            }
        }
        Ok(CycleOutcome::Flushed(flushed))
    }
}

/// A relative `db_path` contributes only its file name inside the date
/// directory; an absolute one is honored verbatim.
fn resolve_db_path(wal_dir: &Path, db_path: &Path) -> PathBuf {
    if db_path.is_absolute() {
        db_path.to_path_buf()
    } else {
        let name = db_path
            .file_name()
            .unwrap_or_else(|| OsStr::new("data.duckdb"));
        wal_dir.join(name)
    }
}
