//! Timestamp normalization.
//!
//! Every moment that enters the engine is normalized to a tz-aware UTC
//! `DateTime` here, and every moment that leaves it is serialized back to
//! RFC 3339 text here. WAL lines, database rows and cached records all go
//! through the same bridge.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as Json;

use crate::error::{Result, StorageError};

/// Current wall-clock moment in UTC.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Parses ISO-8601 / RFC 3339 text into a UTC moment.
///
/// Accepts an explicit offset (`Z` included), a naive datetime with `T` or
/// space separator (assumed UTC), or a bare date (midnight UTC). Anything
/// else fails with [`StorageError::BadTimestamp`].
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(midnight_utc(date));
    }
    Err(StorageError::BadTimestamp(text.to_string()))
}

/// Parses a datetime string only; bare dates are not accepted.
///
/// Used by the in-place `data` walk, which must not rewrite date-shaped
/// labels.
fn parse_datetime_only(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Walks a JSON value recursively, rewriting every recognizable datetime
/// string into canonical RFC 3339 UTC in place.
pub fn normalize_json_timestamps(value: &mut Json) {
    match value {
        Json::String(s) => {
            if let Some(dt) = parse_datetime_only(s) {
                *s = to_rfc3339(dt);
            }
        }
        Json::Array(items) => {
            for item in items {
                normalize_json_timestamps(item);
            }
        }
        Json::Object(map) => {
            for (_, item) in map.iter_mut() {
                normalize_json_timestamps(item);
            }
        }
        _ => {}
    }
}

/// Canonical RFC 3339 serialization with offset, microsecond precision.
pub fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// A timestamp supplied by the caller, either already parsed or as text.
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampSpec {
    /// An already tz-aware moment.
    Moment(DateTime<Utc>),
    /// ISO-8601 text, normalized via [`parse_timestamp`].
    Text(String),
}

impl TimestampSpec {
    /// Normalizes to a UTC moment.
    pub fn resolve(self) -> Result<DateTime<Utc>> {
        match self {
            Self::Moment(dt) => Ok(dt),
            Self::Text(text) => parse_timestamp(&text),
        }
    }
}

impl From<DateTime<Utc>> for TimestampSpec {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Moment(dt)
    }
}

impl From<&str> for TimestampSpec {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for TimestampSpec {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// A calendar date scoping one storage tree (dated mode) or one WAL/backup
/// directory (collection mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageDate(NaiveDate);

impl StorageDate {
    /// Today's date in UTC.
    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    /// Parses `YYYY-MM-DD`, or full datetime text whose date part is taken.
    pub fn parse(text: &str) -> Result<Self> {
        let date_part = text
            .split_once('T')
            .map(|(d, _)| d)
            .unwrap_or(text)
            .trim();
        if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
            return Ok(Self(date));
        }
        Ok(Self(parse_timestamp(text)?.date_naive()))
    }

    /// The wrapped calendar date.
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl std::fmt::Display for StorageDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl From<NaiveDate> for StorageDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl From<DateTime<Utc>> for StorageDate {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.date_naive())
    }
}
