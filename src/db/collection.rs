//! Collection-mode DuckDB gateway: global `storage_history` and
//! `storage_latest` tables in separate database files.

use std::path::{Path, PathBuf};

use duckdb::types::Value as DbValue;
use duckdb::{AccessMode, Config, Connection, ToSql};
use tracing::info;

use crate::db::{
    data_value, opt_int, opt_text, opt_timestamp, probe_table, read_data, read_f64,
    read_i64, read_text, read_timestamp, version_value,
};
use crate::error::{Result, StorageError};
use crate::record::{CollectionRecord, OpKind, ScalarValue};
use crate::schema::ExtraSchema;

const HISTORY_RECOVERY: &str = "To recover: delete the file, call \
     rebuild_history_from_wal(date) for each date that needs recovery, then \
     rebuild_latest_from_history()";
const LATEST_RECOVERY: &str =
    "To recover: delete the file and call rebuild_latest_from_history()";

/// Returns true when the database file is absent, or present, openable and
/// able to count rows in `table`. An existing connection may be passed to
/// avoid a conflicting read-only open.
pub fn check_database_health(path: &Path, table: &str, conn: Option<&Connection>) -> bool {
    if !path.exists() {
        return true;
    }
    let count = |c: &Connection| -> duckdb::Result<i64> {
        c.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
            row.get(0)
        })
    };
    match conn {
        Some(c) => count(c).is_ok(),
        None => Config::default()
            .access_mode(AccessMode::ReadOnly)
            .and_then(|config| Connection::open_with_flags(path, config))
            .map(|c| count(&c).is_ok())
            .unwrap_or(false),
    }
}

/// Gateway over the history/latest database pair.
pub(crate) struct CollectionDb {
    history: Connection,
    latest: Connection,
    history_path: PathBuf,
    latest_path: PathBuf,
    schema: ExtraSchema,
    history_sql: String,
    latest_sql: String,
}

impl CollectionDb {
    /// Opens or creates both databases, applies DDL, and probes
    /// pre-existing files.
    pub fn open(history_path: &Path, latest_path: &Path, schema: &ExtraSchema) -> Result<Self> {
        let history_existed = history_path.exists();
        let latest_existed = latest_path.exists();

        let history = open_one(history_path, HISTORY_RECOVERY)?;
        history.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS storage_history (
                key VARCHAR NOT NULL,
                collection_name VARCHAR NOT NULL DEFAULT '',
                item_name VARCHAR NOT NULL DEFAULT '',
                data JSON,
                value_int BIGINT,
                value_float DOUBLE,
                value_string VARCHAR,
                timestamp TIMESTAMP,
                status VARCHAR,
                status_int INTEGER,
                username VARCHAR,
                updated_at TIMESTAMP,
                version INTEGER DEFAULT 1{extras},
                PRIMARY KEY (key, collection_name, item_name, version)
            )",
            extras = schema.ddl_fragment()
        ))?;
        if history_existed {
            probe_table(&history, history_path, "storage_history", HISTORY_RECOVERY)?;
        }

        let latest = open_one(latest_path, LATEST_RECOVERY)?;
        latest.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS storage_latest (
                key VARCHAR NOT NULL,
                collection_name VARCHAR NOT NULL DEFAULT '',
                item_name VARCHAR NOT NULL DEFAULT '',
                data JSON,
                value_int BIGINT,
                value_float DOUBLE,
                value_string VARCHAR,
                timestamp TIMESTAMP,
                status VARCHAR,
                status_int INTEGER,
                username VARCHAR,
                updated_at TIMESTAMP,
                version INTEGER DEFAULT 1{extras},
                PRIMARY KEY (key, collection_name, item_name)
            )",
            extras = schema.ddl_fragment()
        ))?;
        if latest_existed {
            probe_table(&latest, latest_path, "storage_latest", LATEST_RECOVERY)?;
        }

        let column_list = format!(
            "(key, collection_name, item_name, data, value_int, value_float, \
             value_string, timestamp, status, status_int, username, updated_at, \
             version{cols})",
            cols = schema.column_list_fragment()
        );
        let placeholders = vec!["?"; 13 + schema.columns().len()].join(", ");
        let history_sql = format!(
            "INSERT OR REPLACE INTO storage_history {column_list} VALUES ({placeholders})"
        );
        let latest_sql = format!(
            "INSERT OR REPLACE INTO storage_latest {column_list} VALUES ({placeholders})"
        );

        info!("initialized collection databases (history and latest)");
        Ok(Self {
            history,
            latest,
            history_path: history_path.to_path_buf(),
            latest_path: latest_path.to_path_buf(),
            schema: schema.clone(),
            history_sql,
            latest_sql,
        })
    }

    /// Appends a batch of versions to the history table atomically.
    ///
    /// The identity+version primary key makes re-replay of a WAL segment
    /// whose deletion previously failed exactly idempotent.
    pub fn append_history(&mut self, batch: &[CollectionRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.history.transaction()?;
        {
            let mut stmt = tx.prepare(&self.history_sql)?;
            for record in batch {
                execute_record(&mut stmt, record, &self.schema)?;
            }
        }
        tx.commit()?;
        info!(records = batch.len(), "flushed batch to storage_history");
        Ok(())
    }

    /// Upserts one row per identity into the latest table atomically.
    pub fn upsert_latest(&mut self, records: &[CollectionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let tx = self.latest.transaction()?;
        {
            let mut stmt = tx.prepare(&self.latest_sql)?;
            for record in records {
                execute_record(&mut stmt, record, &self.schema)?;
            }
        }
        tx.commit()?;
        info!(records = records.len(), "updated storage_latest");
        Ok(())
    }

    /// Reads one full collection out of the latest table.
    pub fn load_collection(
        &self,
        key: &str,
        collection_name: &str,
    ) -> Result<Vec<CollectionRecord>> {
        let mut stmt = self.latest.prepare(
            "SELECT key, collection_name, item_name, data, value_int, value_float, \
             value_string, timestamp, status, status_int, username, updated_at, \
             version FROM storage_latest WHERE key = ? AND collection_name = ?",
        )?;
        let mut rows = stmt.query([key, collection_name])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_row(row, &self.schema)?);
        }
        Ok(records)
    }

    /// Rebuilds the latest table from the newest history version of every
    /// identity. Returns the rebuilt rows so the caller can refresh its
    /// cache. Idempotent for a fixed history.
    pub fn rebuild_latest_from_history(&mut self) -> Result<Vec<CollectionRecord>> {
        let mut stmt = self.history.prepare(
            "SELECT key, collection_name, item_name, data, value_int, value_float, \
             value_string, timestamp, status, status_int, username, updated_at, version \
             FROM storage_history \
             WHERE (key, collection_name, item_name, version) IN ( \
                 SELECT key, collection_name, item_name, max(version) \
                 FROM storage_history GROUP BY key, collection_name, item_name)",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_row(row, &self.schema)?);
        }
        drop(rows);
        drop(stmt);

        self.latest.execute("DELETE FROM storage_latest", [])?;
        self.upsert_latest(&records)?;
        info!(records = records.len(), "rebuilt latest table from history");
        Ok(records)
    }

    /// Paths of the database pair `(history, latest)`.
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.history_path, &self.latest_path)
    }
}

fn open_one(path: &Path, recovery: &str) -> Result<Connection> {
    let existed = path.exists();
    Connection::open(path).map_err(|err| {
        if existed {
            StorageError::DbCorrupt {
                path: path.to_path_buf(),
                detail: err.to_string(),
                recovery: recovery.to_string(),
            }
        } else {
            err.into()
        }
    })
}

/// Binds one record to a prepared history/latest statement and executes it.
fn execute_record(
    stmt: &mut duckdb::Statement<'_>,
    record: &CollectionRecord,
    schema: &ExtraSchema,
) -> Result<()> {
    let (value_int, value_float, value_string) = match &record.value {
        Some(ScalarValue::Int(v)) => (DbValue::BigInt(*v), DbValue::Null, DbValue::Null),
        Some(ScalarValue::Float(v)) => (DbValue::Null, DbValue::Double(*v), DbValue::Null),
        Some(ScalarValue::Text(v)) => {
            (DbValue::Null, DbValue::Null, DbValue::Text(v.clone()))
        }
        None => (DbValue::Null, DbValue::Null, DbValue::Null),
    };
    let mut values = vec![
        DbValue::Text(record.key.clone()),
        DbValue::Text(record.collection_name.clone()),
        DbValue::Text(record.item_name.clone()),
        data_value(&record.data)?,
        value_int,
        value_float,
        value_string,
        opt_timestamp(record.timestamp),
        opt_text(record.status.as_deref()),
        opt_int(record.status_int),
        opt_text(record.username.as_deref()),
        opt_timestamp(Some(record.updated_at)),
        version_value(record.version),
    ];
    values.extend(schema.bind_values(&record.extras));
    let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
    stmt.execute(&params[..])?;
    Ok(())
}

/// Decodes one history/latest row into a record.
fn decode_row(row: &duckdb::Row<'_>, schema: &ExtraSchema) -> Result<CollectionRecord> {
    let data = read_data(&row.get::<_, DbValue>(3)?);
    let extras = schema.extract(&data);

    let value = if let Some(v) = read_i64(&row.get::<_, DbValue>(4)?) {
        Some(ScalarValue::Int(v))
    } else if let Some(v) = read_f64(&row.get::<_, DbValue>(5)?) {
        Some(ScalarValue::Float(v))
    } else {
        read_text(&row.get::<_, DbValue>(6)?).map(ScalarValue::Text)
    };

    Ok(CollectionRecord {
        op: OpKind::Put,
        updated_at: read_timestamp(&row.get::<_, DbValue>(11)?)
            .unwrap_or_else(crate::timestamp::now_utc),
        key: row.get(0)?,
        collection_name: row.get(1)?,
        item_name: row.get(2)?,
        data,
        value,
        timestamp: read_timestamp(&row.get::<_, DbValue>(7)?),
        status: read_text(&row.get::<_, DbValue>(8)?),
        status_int: read_i64(&row.get::<_, DbValue>(9)?).map(|v| v as i32),
        username: read_text(&row.get::<_, DbValue>(10)?),
        version: read_i64(&row.get::<_, DbValue>(12)?).unwrap_or(1),
        extras,
    })
}
