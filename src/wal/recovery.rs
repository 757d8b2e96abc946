//! WAL segment replay.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::Result;
use crate::wal::writer::list_segments;

/// Replays every segment in `dir` in sequence order and returns the
/// recovered records in append order.
///
/// A torn tail (final line without a terminating newline) is dropped
/// silently; malformed interior lines are dropped with a warning. Either
/// way the remaining records stand on their own: each line is a complete
/// self-describing record.
pub fn replay<L: DeserializeOwned>(dir: &Path) -> Result<Vec<L>> {
    let segments = list_segments(dir)?;
    if segments.is_empty() {
        return Ok(Vec::new());
    }
    info!(count = segments.len(), dir = %dir.display(), "replaying WAL segments");

    let mut records = Vec::new();
    for (_, path) in &segments {
        let raw = fs::read(path)?;
        let recovered = parse_lines(&raw, &mut records);
        info!(
            segment = %path.display(),
            records = recovered,
            "recovered records from segment"
        );
    }
    Ok(records)
}

/// Parses newline-terminated JSON lines out of one segment's bytes,
/// appending recovered records to `out`. Returns how many were recovered.
fn parse_lines<L: DeserializeOwned>(raw: &[u8], out: &mut Vec<L>) -> usize {
    let complete = match raw.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => &raw[..=last_newline],
        // No newline at all: the whole segment is one torn line.
        None => &[][..],
    };

    let mut recovered = 0;
    for line in complete.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(record) => {
                out.push(record);
                recovered += 1;
            }
            Err(err) => {
                warn!(%err, "dropping malformed WAL line");
            }
        }
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as Json;
    use tempfile::TempDir;

    #[test]
    fn replays_segments_in_sequence_order() {
        let tmp = TempDir::new().expect("tmp");
        std::fs::write(tmp.path().join("wal_000002.jsonl"), "{\"n\":2}\n").expect("seed");
        std::fs::write(tmp.path().join("wal_000001.jsonl"), "{\"n\":1}\n").expect("seed");

        let records: Vec<Json> = replay(tmp.path()).expect("replay");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["n"], 1);
        assert_eq!(records[1]["n"], 2);
    }

    #[test]
    fn torn_tail_is_dropped_and_earlier_lines_survive() {
        let tmp = TempDir::new().expect("tmp");
        std::fs::write(
            tmp.path().join("wal_000001.jsonl"),
            "{\"n\":1}\n{\"n\":2}\n{\"n\":3,\"tr",
        )
        .expect("seed");

        let records: Vec<Json> = replay(tmp.path()).expect("replay");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["n"], 2);
    }

    #[test]
    fn malformed_interior_line_is_skipped() {
        let tmp = TempDir::new().expect("tmp");
        std::fs::write(
            tmp.path().join("wal_000001.jsonl"),
            "{\"n\":1}\nnot json at all\n{\"n\":3}\n",
        )
        .expect("seed");

        let records: Vec<Json> = replay(tmp.path()).expect("replay");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["n"], 1);
        assert_eq!(records[1]["n"], 3);
    }

    #[test]
    fn empty_directory_recovers_nothing() {
        let tmp = TempDir::new().expect("tmp");
        let records: Vec<Json> = replay(tmp.path()).expect("replay");
        assert!(records.is_empty());
    }
}
