//! DuckDB gateways and value bridging.
//!
//! The gateways own the only database connections in the engine. All
//! binding and row decoding goes through the helpers here so every path
//! shares one JSON/native bridge.

use chrono::{DateTime, Utc};
use duckdb::types::{TimeUnit, Value as DbValue};
use duckdb::Connection;
use serde_json::{Map, Value as Json};

use crate::error::{Result, StorageError};
use crate::types::Version;

/// Collection-mode gateway over the history/latest database pair.
pub mod collection;
/// Dated-mode gateway over the per-date database.
pub mod dated;

/// Escapes a string for embedding in single-quoted SQL literals.
pub(crate) fn sql_quote(text: &str) -> String {
    text.replace('\'', "''")
}

/// Runs the integrity probe on one table: a full row count must succeed.
pub(crate) fn probe_table(
    conn: &Connection,
    path: &std::path::Path,
    table: &str,
    recovery: &str,
) -> Result<()> {
    let counted: duckdb::Result<i64> =
        conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
            row.get(0)
        });
    match counted {
        Ok(_) => Ok(()),
        Err(err) => Err(StorageError::DbCorrupt {
            path: path.to_path_buf(),
            detail: err.to_string(),
            recovery: recovery.to_string(),
        }),
    }
}

/// Binds optional text.
pub(crate) fn opt_text(value: Option<&str>) -> DbValue {
    match value {
        Some(text) => DbValue::Text(text.to_string()),
        None => DbValue::Null,
    }
}

/// Binds an optional 32-bit integer.
pub(crate) fn opt_int(value: Option<i32>) -> DbValue {
    match value {
        Some(v) => DbValue::Int(v),
        None => DbValue::Null,
    }
}

/// Binds an optional moment at microsecond precision.
pub(crate) fn opt_timestamp(value: Option<DateTime<Utc>>) -> DbValue {
    match value {
        Some(dt) => DbValue::Timestamp(TimeUnit::Microsecond, dt.timestamp_micros()),
        None => DbValue::Null,
    }
}

/// Binds a version as the INTEGER column value.
pub(crate) fn version_value(version: Version) -> DbValue {
    DbValue::Int(version as i32)
}

/// Binds a `data` map as its JSON text.
pub(crate) fn data_value(data: &Map<String, Json>) -> Result<DbValue> {
    Ok(DbValue::Text(serde_json::to_string(data)?))
}

/// Decodes a nullable text column.
pub(crate) fn read_text(value: &DbValue) -> Option<String> {
    match value {
        DbValue::Text(text) => Some(text.clone()),
        _ => None,
    }
}

/// Decodes a nullable integer column of any width.
pub(crate) fn read_i64(value: &DbValue) -> Option<i64> {
    match value {
        DbValue::TinyInt(v) => Some(*v as i64),
        DbValue::SmallInt(v) => Some(*v as i64),
        DbValue::Int(v) => Some(*v as i64),
        DbValue::BigInt(v) => Some(*v),
        _ => None,
    }
}

/// Decodes a nullable floating-point column.
pub(crate) fn read_f64(value: &DbValue) -> Option<f64> {
    match value {
        DbValue::Float(v) => Some(*v as f64),
        DbValue::Double(v) => Some(*v),
        _ => None,
    }
}

/// Decodes a nullable TIMESTAMP column into a UTC moment.
pub(crate) fn read_timestamp(value: &DbValue) -> Option<DateTime<Utc>> {
    match value {
        DbValue::Timestamp(TimeUnit::Second, v) => DateTime::from_timestamp(*v, 0),
        DbValue::Timestamp(TimeUnit::Millisecond, v) => DateTime::from_timestamp_millis(*v),
        DbValue::Timestamp(TimeUnit::Microsecond, v) => DateTime::from_timestamp_micros(*v),
        DbValue::Timestamp(TimeUnit::Nanosecond, v) => Some(DateTime::from_timestamp_nanos(*v)),
        _ => None,
    }
}

/// Decodes a JSON `data` column back into a map.
pub(crate) fn read_data(value: &DbValue) -> Map<String, Json> {
    read_text(value)
        .and_then(|text| serde_json::from_str::<Json>(&text).ok())
        .and_then(|json| json.as_object().cloned())
        .unwrap_or_default()
}
