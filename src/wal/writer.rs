//! WAL segment writer.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::types::WalSeq;

/// Segment file name for a sequence number: `wal_000001.jsonl`.
fn segment_name(seq: WalSeq) -> String {
    format!("wal_{seq:06}.jsonl")
}

/// Parses a sequence number out of a segment file name.
fn parse_segment_name(name: &str) -> Option<WalSeq> {
    name.strip_prefix("wal_")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

/// Lists segment files in a directory, sorted by sequence number.
pub fn list_segments(dir: &Path) -> Result<Vec<(WalSeq, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(seq) = name.to_str().and_then(parse_segment_name) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Attempts to fsync a directory so a new file entry is durable.
///
/// Not every platform supports directory fsync; failure is only a warning.
fn sync_dir(dir: &Path) {
    if !cfg!(unix) {
        return;
    }
    let result = File::open(dir).and_then(|f| f.sync_all());
    if let Err(err) = result {
        warn!(dir = %dir.display(), %err, "could not fsync WAL directory");
    }
}

struct OpenSegment {
    path: PathBuf,
    file: File,
    bytes: u64,
    count: usize,
    opened_at: Instant,
}

/// Append-only writer over rotating JSON-lines segments.
///
/// Owns the only writable handle into its directory. `append` returns only
/// after write and fsync of the line have completed.
pub struct WalWriter {
    dir: PathBuf,
    seq: WalSeq,
    current: Option<OpenSegment>,
}

impl WalWriter {
    /// Opens a writer over `dir`, resuming the sequence after the highest
    /// existing segment. No segment is created until the first append.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let seq = list_segments(&dir)?
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(0);
        Ok(Self {
            dir,
            seq,
            current: None,
        })
    }

    /// Serializes one record as a newline-terminated JSON line and appends
    /// it durably (write + fsync) to the current segment, opening one if
    /// needed.
    pub fn append<L: Serialize>(&mut self, line: &L) -> Result<()> {
        if self.current.is_none() {
            self.roll()?;
        }
        let mut buf = serde_json::to_vec(line)?;
        buf.push(b'\n');

        // Unwrap-free: roll() above guarantees an open segment.
        let Some(segment) = self.current.as_mut() else {
            return Ok(());
        };
        segment.file.write_all(&buf)?;
        segment.file.sync_data()?;
        segment.bytes += buf.len() as u64;
        segment.count += 1;
        Ok(())
    }

    /// Seals the current segment (flush + fsync + close) without opening
    /// a successor.
    pub fn seal(&mut self) -> Result<()> {
        if let Some(segment) = self.current.take() {
            segment.file.sync_all()?;
            drop(segment.file);
        }
        Ok(())
    }

    /// Seals the current segment and opens the next one in sequence.
    pub fn rotate(&mut self) -> Result<()> {
        self.seal()?;
        self.roll()
    }

    fn roll(&mut self) -> Result<()> {
        self.seal()?;
        self.seq += 1;
        let path = self.dir.join(segment_name(self.seq));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.current = Some(OpenSegment {
            path,
            file,
            bytes: 0,
            count: 0,
            opened_at: Instant::now(),
        });
        sync_dir(&self.dir);
        info!(segment = %segment_name(self.seq), "rotated to new WAL segment");
        Ok(())
    }

    /// True when the open segment has crossed a rotation threshold.
    pub fn over_threshold(&self, max_size: u64, max_age: Option<Duration>) -> bool {
        let Some(segment) = &self.current else {
            return false;
        };
        if segment.bytes >= max_size {
            return true;
        }
        match max_age {
            Some(age) => segment.opened_at.elapsed() >= age,
            None => false,
        }
    }

    /// True when a segment is currently open for append.
    pub fn has_open_segment(&self) -> bool {
        self.current.is_some()
    }

    /// Path of the open segment, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.path.as_path())
    }

    /// Segment paths that are sealed (everything except the open one).
    pub fn sealed_segments(&self) -> Result<Vec<PathBuf>> {
        let current = self.current.as_ref().map(|s| s.path.clone());
        Ok(list_segments(&self.dir)?
            .into_iter()
            .map(|(_, path)| path)
            .filter(|path| Some(path) != current.as_ref())
            .collect())
    }

    /// WAL directory this writer owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes appended to the open segment.
    pub fn current_size(&self) -> u64 {
        self.current.as_ref().map(|s| s.bytes).unwrap_or(0)
    }

    /// Records appended to the open segment.
    pub fn current_count(&self) -> usize {
        self.current.as_ref().map(|s| s.count).unwrap_or(0)
    }

    /// Sequence number of the open (or last opened) segment.
    pub fn sequence(&self) -> WalSeq {
        self.seq
    }
}
