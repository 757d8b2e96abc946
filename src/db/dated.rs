//! Dated-mode DuckDB gateway: one `storage_data` table per date.

use std::fs;
use std::path::Path;

use duckdb::types::Value as DbValue;
use duckdb::{Connection, ToSql};
use tracing::info;

use crate::db::{
    data_value, opt_int, opt_text, opt_timestamp, probe_table, read_data, read_i64,
    read_text, read_timestamp, sql_quote, version_value,
};
use crate::error::{Result, StorageError};
use crate::record::{DatedRecord, OpKind};
use crate::schema::ExtraSchema;

const RECOVERY_STEPS: &str =
    "To recover: delete the file and reopen; the current date's records replay from the WAL.";

/// Gateway over the per-date `storage_data` table.
pub(crate) struct DatedDb {
    conn: Connection,
    schema: ExtraSchema,
    upsert_sql: String,
}

impl DatedDb {
    /// Opens or creates the database, applies the DDL, and runs the
    /// integrity probe on pre-existing files.
    pub fn open(path: &Path, schema: &ExtraSchema) -> Result<Self> {
        let existed = path.exists();
        let conn = Connection::open(path).map_err(|err| {
            if existed {
                StorageError::DbCorrupt {
                    path: path.to_path_buf(),
                    detail: err.to_string(),
                    recovery: RECOVERY_STEPS.to_string(),
                }
            } else {
                err.into()
            }
        })?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS storage_data (
                key VARCHAR NOT NULL,
                process_name VARCHAR NOT NULL DEFAULT '',
                data JSON,
                timestamp TIMESTAMP,
                status VARCHAR,
                status_int INTEGER,
                username VARCHAR,
                updated_at TIMESTAMP,
                version INTEGER DEFAULT 1{extras},
                PRIMARY KEY (key, process_name)
            )",
            extras = schema.ddl_fragment()
        ))?;

        if existed {
            probe_table(&conn, path, "storage_data", RECOVERY_STEPS)?;
        }

        let placeholders = vec!["?"; 9 + schema.columns().len()].join(", ");
        let upsert_sql = format!(
            "INSERT OR REPLACE INTO storage_data \
             (key, process_name, data, timestamp, status, status_int, username, \
              updated_at, version{cols}) VALUES ({placeholders})",
            cols = schema.column_list_fragment()
        );

        Ok(Self {
            conn,
            schema: schema.clone(),
            upsert_sql,
        })
    }

    /// Upserts a batch atomically; on failure the transaction rolls back
    /// and the batch stays pending at the caller.
    pub fn upsert_batch(&mut self, batch: &[DatedRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&self.upsert_sql)?;
            for record in batch {
                let mut values = vec![
                    DbValue::Text(record.key.clone()),
                    DbValue::Text(record.process_name.clone()),
                    data_value(&record.data)?,
                    opt_timestamp(record.timestamp),
                    opt_text(record.status.as_deref()),
                    opt_int(record.status_int),
                    opt_text(record.username.as_deref()),
                    opt_timestamp(Some(record.updated_at)),
                    version_value(record.version),
                ];
                values.extend(self.schema.bind_values(&record.extras));
                let params: Vec<&dyn ToSql> =
                    values.iter().map(|v| v as &dyn ToSql).collect();
                stmt.execute(&params[..])?;
            }
        }
        tx.commit()?;
        info!(records = batch.len(), "flushed batch to storage_data");
        Ok(())
    }

    /// Full-table scan used to rebuild the cache at startup.
    pub fn scan_all(&self) -> Result<Vec<DatedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, process_name, data, timestamp, status, status_int, \
             username, updated_at, version FROM storage_data",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let data = read_data(&row.get::<_, DbValue>(2)?);
            let extras = self.schema.extract(&data);
            records.push(DatedRecord {
                op: OpKind::Put,
                updated_at: read_timestamp(&row.get::<_, DbValue>(7)?)
                    .unwrap_or_else(crate::timestamp::now_utc),
                key: row.get(0)?,
                process_name: row.get(1)?,
                data,
                timestamp: read_timestamp(&row.get::<_, DbValue>(3)?),
                status: read_text(&row.get::<_, DbValue>(4)?),
                status_int: read_i64(&row.get::<_, DbValue>(5)?).map(|v| v as i32),
                username: read_text(&row.get::<_, DbValue>(6)?),
                version: read_i64(&row.get::<_, DbValue>(8)?).unwrap_or(1),
                extras,
            });
        }
        Ok(records)
    }

    /// Number of rows in `storage_data`.
    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT count(*) FROM storage_data", [], |row| row.get(0))?)
    }

    /// Writes the whole table as Hive-partitioned parquet under `target`,
    /// partitioned by `process_name` then `date`. Returns the exported row
    /// count (0 means nothing was written).
    pub fn export_parquet(&self, target: &Path, date_str: &str) -> Result<usize> {
        let rows = self.count()?;
        if rows == 0 {
            return Ok(0);
        }
        fs::create_dir_all(target)?;
        let sql = format!(
            "COPY (SELECT key, process_name, data, timestamp, status, status_int, \
             username, updated_at, version{cols}, '{date}' AS date FROM storage_data) \
             TO '{path}' (FORMAT PARQUET, PARTITION_BY (process_name, date), \
             OVERWRITE_OR_IGNORE, FILENAME_PATTERN 'data')",
            cols = self.schema.column_list_fragment(),
            date = sql_quote(date_str),
            path = sql_quote(&target.to_string_lossy()),
        );
        self.conn.execute_batch(&sql)?;
        info!(rows, target = %target.display(), "exported storage_data to parquet");
        Ok(rows as usize)
    }
}
