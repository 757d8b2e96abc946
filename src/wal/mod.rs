//! Write-ahead log: rotating, fsync'd JSON-lines segments.
//!
//! Every `store` call becomes one self-describing line in the current
//! segment. A record is durable once its line has been written and
//! fsynced; segments are deleted only after their records have been
//! committed to the database.

/// Segment replay for crash recovery.
pub mod recovery;
/// Append path, rotation, and segment bookkeeping.
pub mod writer;
