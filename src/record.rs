//! Record model shared by every ingress and egress path.
//!
//! One struct per mode serves as the WAL line payload, the cache entry,
//! and the source of database bind parameters, so the JSON/native bridge
//! lives in exactly one place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{Result, StorageError};
use crate::schema::ExtraSchema;
use crate::timestamp::{now_utc, normalize_json_timestamps, parse_timestamp, to_rfc3339, TimestampSpec};
use crate::types::{keys, Version};

/// Operation kind header carried on every WAL line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Full-record upsert. The only operation in the current design.
    #[serde(rename = "put")]
    Put,
}

/// Typed scalar routed into `value_int` / `value_float` / `value_string`.
///
/// Serialized untagged so the WAL carries native JSON numbers and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// Routed to `value_int`.
    Int(i64),
    /// Routed to `value_float`.
    Float(f64),
    /// Routed to `value_string`.
    Text(String),
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A dated-mode record: one WAL line, one cache entry, one table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatedRecord {
    /// Operation header.
    pub op: OpKind,
    /// Moment the record was written; also the `updated_at` column.
    #[serde(rename = "ts")]
    pub updated_at: DateTime<Utc>,
    /// Application key.
    pub key: String,
    /// Process identity; empty string means unspecified.
    pub process_name: String,
    /// The full user payload, special fields included.
    pub data: Map<String, Json>,
    /// Lifted record timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Lifted status text.
    pub status: Option<String>,
    /// Lifted numeric status.
    pub status_int: Option<i32>,
    /// Lifted username.
    pub username: Option<String>,
    /// Monotonic version within `(key, process_name)`.
    pub version: Version,
    /// Raw values for user-declared extra columns.
    pub extras: BTreeMap<String, Json>,
}

/// A collection-mode record: one WAL line, one cache entry, one history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    /// Operation header.
    pub op: OpKind,
    /// Moment the record was written; also the `updated_at` column.
    #[serde(rename = "ts")]
    pub updated_at: DateTime<Utc>,
    /// Application key.
    pub key: String,
    /// Collection identity; empty string means unspecified.
    pub collection_name: String,
    /// Item identity; empty string means unspecified.
    pub item_name: String,
    /// The full user payload, special fields included (never `value`).
    pub data: Map<String, Json>,
    /// Type-routed scalar value.
    pub value: Option<ScalarValue>,
    /// Lifted record timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Lifted status text.
    pub status: Option<String>,
    /// Lifted numeric status.
    pub status_int: Option<i32>,
    /// Lifted username.
    pub username: Option<String>,
    /// Monotonic version within `(key, collection_name, item_name)`.
    pub version: Version,
    /// Raw values for user-declared extra columns.
    pub extras: BTreeMap<String, Json>,
}

/// Special fields shared by both record shapes, lifted out of `data`.
struct Lifted {
    timestamp: DateTime<Utc>,
    status: Option<String>,
    status_int: Option<i32>,
    username: Option<String>,
}

/// Applies the parameter > data-field > default precedence and normalizes
/// every timestamp inside `data` in place.
fn lift(
    data: &mut Map<String, Json>,
    timestamp: Option<TimestampSpec>,
    username: Option<String>,
) -> Result<Lifted> {
    let timestamp = match timestamp {
        Some(spec) => spec.resolve()?,
        None => match data.get(keys::TIMESTAMP) {
            Some(Json::String(text)) => parse_timestamp(text)?,
            Some(Json::Null) | None => now_utc(),
            Some(other) => return Err(StorageError::BadTimestamp(other.to_string())),
        },
    };

    let username = username.or_else(|| {
        data.get(keys::USERNAME)
            .and_then(Json::as_str)
            .map(str::to_string)
    });
    let status = data
        .get(keys::STATUS)
        .and_then(Json::as_str)
        .map(str::to_string);
    let status_int = data
        .get(keys::STATUS_INT)
        .and_then(Json::as_i64)
        .and_then(|v| i32::try_from(v).ok());

    for (_, value) in data.iter_mut() {
        normalize_json_timestamps(value);
    }

    // Lifting never strips: the normalized values go back into the blob.
    data.insert(keys::TIMESTAMP.to_string(), Json::String(to_rfc3339(timestamp)));
    if let Some(name) = &username {
        data.insert(keys::USERNAME.to_string(), Json::String(name.clone()));
    }

    Ok(Lifted {
        timestamp,
        status,
        status_int,
        username,
    })
}

impl DatedRecord {
    /// Builds a record from a `store` call, lifting special fields and
    /// extracting extra-column values.
    pub(crate) fn build(
        key: &str,
        mut data: Map<String, Json>,
        process_name: Option<String>,
        timestamp: Option<TimestampSpec>,
        username: Option<String>,
        version: Version,
        schema: &ExtraSchema,
    ) -> Result<Self> {
        let process_name = process_name
            .or_else(|| {
                data.get(keys::PROCESS_NAME)
                    .and_then(Json::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let lifted = lift(&mut data, timestamp, username)?;
        data.insert(
            keys::PROCESS_NAME.to_string(),
            Json::String(process_name.clone()),
        );
        let extras = schema.extract(&data);

        Ok(Self {
            op: OpKind::Put,
            updated_at: now_utc(),
            key: key.to_string(),
            process_name,
            data,
            timestamp: Some(lifted.timestamp),
            status: lifted.status,
            status_int: lifted.status_int,
            username: lifted.username,
            version,
            extras,
        })
    }
}

impl CollectionRecord {
    /// Builds a record from a `store` call, lifting special fields and
    /// extracting extra-column values.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        key: &str,
        mut data: Map<String, Json>,
        item_name: Option<String>,
        collection_name: Option<String>,
        value: Option<ScalarValue>,
        timestamp: Option<TimestampSpec>,
        username: Option<String>,
        version: Version,
        schema: &ExtraSchema,
    ) -> Result<Self> {
        let lifted = lift(&mut data, timestamp, username)?;
        let extras = schema.extract(&data);

        Ok(Self {
            op: OpKind::Put,
            updated_at: now_utc(),
            key: key.to_string(),
            collection_name: collection_name.unwrap_or_default(),
            item_name: item_name.unwrap_or_default(),
            data,
            value,
            timestamp: Some(lifted.timestamp),
            status: lifted.status,
            status_int: lifted.status_int,
            username: lifted.username,
            version,
            extras,
        })
    }

    /// The identity triple for change tracking.
    pub fn identity(&self) -> (String, String, String) {
        (
            self.key.clone(),
            self.collection_name.clone(),
            self.item_name.clone(),
        )
    }
}
