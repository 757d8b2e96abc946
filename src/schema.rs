//! Extra-column schema registry.
//!
//! Users may declare additional typed columns at initialization. The
//! declaration is validated once, before anything touches the disk, and
//! then drives table DDL, per-record value extraction from `data`, and
//! parameter binding during batch upserts.

use std::collections::BTreeMap;

use duckdb::types::{TimeUnit, Value as DbValue};
use serde_json::Value as Json;
use tracing::warn;

use crate::config::ExtraSchemaDecl;
use crate::error::{Result, StorageError};
use crate::timestamp::parse_timestamp;

/// Column names owned by the engine in dated mode.
pub const DATED_RESERVED: &[&str] = &[
    "key",
    "process_name",
    "data",
    "timestamp",
    "status",
    "status_int",
    "username",
    "updated_at",
    "version",
];

/// Column names owned by the engine in collection mode.
pub const COLLECTION_RESERVED: &[&str] = &[
    "key",
    "collection_name",
    "item_name",
    "data",
    "value_int",
    "value_float",
    "value_string",
    "timestamp",
    "status",
    "status_int",
    "username",
    "updated_at",
    "version",
];

/// Portable column types recognized in extra-schema declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortableType {
    /// `VARCHAR`.
    String,
    /// `BOOLEAN`.
    Bool,
    /// `TINYINT`.
    Int8,
    /// `SMALLINT`.
    Int16,
    /// `INTEGER`.
    Int32,
    /// `BIGINT`.
    Int64,
    /// `UTINYINT`.
    UInt8,
    /// `USMALLINT`.
    UInt16,
    /// `UINTEGER`.
    UInt32,
    /// `UBIGINT`.
    UInt64,
    /// `FLOAT`.
    Float32,
    /// `DOUBLE`.
    Float64,
    /// `TIMESTAMP` (any declared unit; stored at microsecond precision).
    Timestamp,
    /// `DATE`.
    Date,
}

impl PortableType {
    /// Resolves a portable type name, e.g. `int64` or `timestamp[ms]`.
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "string" => Self::String,
            "bool" => Self::Bool,
            "int8" => Self::Int8,
            "int16" => Self::Int16,
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "uint8" => Self::UInt8,
            "uint16" => Self::UInt16,
            "uint32" => Self::UInt32,
            "uint64" => Self::UInt64,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            "timestamp" | "timestamp[s]" | "timestamp[ms]" | "timestamp[us]"
            | "timestamp[ns]" => Self::Timestamp,
            "date32" | "date64" => Self::Date,
            _ => return None,
        };
        Some(ty)
    }

    /// The SQL type realizing this portable type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::String => "VARCHAR",
            Self::Bool => "BOOLEAN",
            Self::Int8 => "TINYINT",
            Self::Int16 => "SMALLINT",
            Self::Int32 => "INTEGER",
            Self::Int64 => "BIGINT",
            Self::UInt8 => "UTINYINT",
            Self::UInt16 => "USMALLINT",
            Self::UInt32 => "UINTEGER",
            Self::UInt64 => "UBIGINT",
            Self::Float32 => "FLOAT",
            Self::Float64 => "DOUBLE",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
        }
    }
}

/// A validated extra-column schema.
#[derive(Debug, Clone, Default)]
pub struct ExtraSchema {
    columns: Vec<(String, PortableType)>,
}

impl ExtraSchema {
    /// Validates a declaration against the mode's reserved column set.
    ///
    /// Column names must be legal SQL identifiers and must not collide
    /// with reserved names; type names must be recognized portable types.
    pub fn new(decl: &ExtraSchemaDecl, reserved: &[&str]) -> Result<Self> {
        let mut columns = Vec::with_capacity(decl.len());
        for (name, type_name) in decl {
            if !is_legal_identifier(name) {
                return Err(StorageError::ExtraSchema(format!(
                    "column name {name:?} is not a legal identifier"
                )));
            }
            if reserved.contains(&name.as_str()) {
                return Err(StorageError::ExtraSchema(format!(
                    "column name {name:?} is reserved"
                )));
            }
            let Some(ty) = PortableType::parse(type_name) else {
                return Err(StorageError::ExtraSchema(format!(
                    "unknown portable type {type_name:?} for column {name:?}"
                )));
            };
            columns.push((name.clone(), ty));
        }
        Ok(Self { columns })
    }

    /// True when no extra columns are declared.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Declared columns in deterministic order.
    pub fn columns(&self) -> &[(String, PortableType)] {
        &self.columns
    }

    /// DDL fragment appended to a `CREATE TABLE` column list, e.g.
    /// `, customer_id BIGINT, price DOUBLE`. Empty when nothing declared.
    pub fn ddl_fragment(&self) -> String {
        let mut ddl = String::new();
        for (name, ty) in &self.columns {
            ddl.push_str(", ");
            ddl.push_str(name);
            ddl.push(' ');
            ddl.push_str(ty.sql_type());
        }
        ddl
    }

    /// Comma-joined column name list fragment, e.g. `, customer_id, price`.
    pub fn column_list_fragment(&self) -> String {
        let mut list = String::new();
        for (name, _) in &self.columns {
            list.push_str(", ");
            list.push_str(name);
        }
        list
    }

    /// Extracts raw per-record values for every declared column from
    /// `data`. Missing fields yield explicit nulls so WAL lines are
    /// self-describing.
    pub fn extract(&self, data: &serde_json::Map<String, Json>) -> BTreeMap<String, Json> {
        self.columns
            .iter()
            .map(|(name, _)| {
                (
                    name.clone(),
                    data.get(name).cloned().unwrap_or(Json::Null),
                )
            })
            .collect()
    }

    /// Binds a record's extras as database values in declaration order.
    pub fn bind_values(&self, extras: &BTreeMap<String, Json>) -> Vec<DbValue> {
        self.columns
            .iter()
            .map(|(name, ty)| {
                let raw = extras.get(name).unwrap_or(&Json::Null);
                coerce(name, *ty, raw)
            })
            .collect()
    }
}

/// Converts a raw JSON value into a typed database value.
///
/// A value whose runtime shape does not match the declared type is stored
/// as NULL with a structured warning, mirroring the missing-field case.
fn coerce(name: &str, ty: PortableType, raw: &Json) -> DbValue {
    if raw.is_null() {
        return DbValue::Null;
    }
    let coerced = match ty {
        PortableType::String => raw.as_str().map(|s| DbValue::Text(s.to_string())),
        PortableType::Bool => raw.as_bool().map(DbValue::Boolean),
        PortableType::Int8 => int_in_range(raw, i8::MIN as i64, i8::MAX as i64)
            .map(|v| DbValue::TinyInt(v as i8)),
        PortableType::Int16 => int_in_range(raw, i16::MIN as i64, i16::MAX as i64)
            .map(|v| DbValue::SmallInt(v as i16)),
        PortableType::Int32 => int_in_range(raw, i32::MIN as i64, i32::MAX as i64)
            .map(|v| DbValue::Int(v as i32)),
        PortableType::Int64 => raw.as_i64().map(DbValue::BigInt),
        PortableType::UInt8 => uint_in_range(raw, u8::MAX as u64).map(|v| DbValue::UTinyInt(v as u8)),
        PortableType::UInt16 => {
            uint_in_range(raw, u16::MAX as u64).map(|v| DbValue::USmallInt(v as u16))
        }
        PortableType::UInt32 => uint_in_range(raw, u32::MAX as u64).map(|v| DbValue::UInt(v as u32)),
        PortableType::UInt64 => raw.as_u64().map(DbValue::UBigInt),
        PortableType::Float32 => raw.as_f64().map(|v| DbValue::Float(v as f32)),
        PortableType::Float64 => raw.as_f64().map(DbValue::Double),
        PortableType::Timestamp => raw
            .as_str()
            .and_then(|s| parse_timestamp(s).ok())
            .map(|dt| DbValue::Timestamp(TimeUnit::Microsecond, dt.timestamp_micros())),
        PortableType::Date => raw
            .as_str()
            .and_then(|s| parse_timestamp(s).ok())
            .map(|dt| {
                let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
                DbValue::Date32((dt.date_naive() - epoch).num_days() as i32)
            }),
    };
    coerced.unwrap_or_else(|| {
        warn!(column = name, value = %raw, "extra column value does not match its declared type; storing NULL");
        DbValue::Null
    })
}

fn int_in_range(raw: &Json, min: i64, max: i64) -> Option<i64> {
    raw.as_i64().filter(|v| (min..=max).contains(v))
}

fn uint_in_range(raw: &Json, max: u64) -> Option<u64> {
    raw.as_u64().filter(|v| *v <= max)
}

fn is_legal_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(pairs: &[(&str, &str)]) -> ExtraSchemaDecl {
        pairs
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn accepts_known_types_and_builds_ddl() {
        let schema = ExtraSchema::new(
            &decl(&[("customer_id", "int64"), ("price", "float64")]),
            DATED_RESERVED,
        )
        .unwrap();
        assert_eq!(schema.ddl_fragment(), ", customer_id BIGINT, price DOUBLE");
        assert_eq!(schema.column_list_fragment(), ", customer_id, price");
    }

    #[test]
    fn rejects_reserved_names_in_both_modes() {
        assert!(matches!(
            ExtraSchema::new(&decl(&[("timestamp", "string")]), DATED_RESERVED),
            Err(StorageError::ExtraSchema(_))
        ));
        assert!(matches!(
            ExtraSchema::new(&decl(&[("value_int", "int64")]), COLLECTION_RESERVED),
            Err(StorageError::ExtraSchema(_))
        ));
    }

    #[test]
    fn rejects_unknown_types_and_bad_identifiers() {
        assert!(matches!(
            ExtraSchema::new(&decl(&[("customer", "weirdtype")]), DATED_RESERVED),
            Err(StorageError::ExtraSchema(_))
        ));
        assert!(matches!(
            ExtraSchema::new(&decl(&[("bad name", "string")]), DATED_RESERVED),
            Err(StorageError::ExtraSchema(_))
        ));
        assert!(matches!(
            ExtraSchema::new(&decl(&[("1st", "string")]), DATED_RESERVED),
            Err(StorageError::ExtraSchema(_))
        ));
    }

    #[test]
    fn extract_yields_explicit_nulls_for_missing_fields() {
        let schema = ExtraSchema::new(
            &decl(&[("customer_id", "int64"), ("notes", "string")]),
            DATED_RESERVED,
        )
        .unwrap();
        let data = serde_json::json!({"customer_id": 42});
        let extras = schema.extract(data.as_object().unwrap());
        assert_eq!(extras["customer_id"], serde_json::json!(42));
        assert_eq!(extras["notes"], Json::Null);
    }

    #[test]
    fn coercion_routes_by_declared_type() {
        let schema = ExtraSchema::new(
            &decl(&[
                ("flag", "bool"),
                ("n", "int32"),
                ("score", "float64"),
                ("seen", "timestamp[us]"),
            ]),
            DATED_RESERVED,
        )
        .unwrap();
        let data = serde_json::json!({
            "flag": true,
            "n": 7,
            "score": 9.5,
            "seen": "2025-01-15T10:30:00Z",
        });
        let extras = schema.extract(data.as_object().unwrap());
        let bound = schema.bind_values(&extras);
        assert_eq!(bound[0], DbValue::Boolean(true));
        assert_eq!(bound[1], DbValue::Int(7));
        assert_eq!(bound[2], DbValue::Double(9.5));
        assert!(matches!(
            bound[3],
            DbValue::Timestamp(TimeUnit::Microsecond, _)
        ));
    }

    #[test]
    fn mismatched_values_store_null() {
        let schema =
            ExtraSchema::new(&decl(&[("n", "int32")]), DATED_RESERVED).unwrap();
        let data = serde_json::json!({"n": "not a number"});
        let bound = schema.bind_values(&schema.extract(data.as_object().unwrap()));
        assert_eq!(bound[0], DbValue::Null);
    }
}
