//! Change tracking for the latest-table materialization.

use hashbrown::HashSet;

/// Set of `(key, collection_name, item_name)` identities written since the
/// last successful latest-table upsert.
///
/// Grown under the write lock; snapshotted under the flush lock and
/// cleared only after the upsert commits.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    modified: HashSet<(String, String, String)>,
}

impl ChangeTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one modified identity.
    pub fn record(&mut self, identity: (String, String, String)) {
        self.modified.insert(identity);
    }

    /// Identities modified since the last clear.
    pub fn snapshot(&self) -> Vec<(String, String, String)> {
        self.modified.iter().cloned().collect()
    }

    /// Forgets everything; called after a successful upsert.
    pub fn clear(&mut self) {
        self.modified.clear();
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.modified.len()
    }

    /// True when nothing has been modified.
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
    }
}
