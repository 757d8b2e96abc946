//! Authoritative in-memory caches, one shape per mode.
//!
//! Plain nested maps; thread safety comes from the orchestrator's write
//! lock. Entries are replaced wholesale after the WAL append succeeds, so
//! readers never observe a record mid-update.

use hashbrown::{HashMap, HashSet};

use crate::record::{CollectionRecord, DatedRecord};
use crate::types::Version;

/// Dated-mode cache: `key → process_name → record`.
#[derive(Debug, Default)]
pub struct DatedCache {
    map: HashMap<String, HashMap<String, DatedRecord>>,
}

impl DatedCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a record, replacing any previous entry for its identity.
    pub fn insert(&mut self, record: DatedRecord) {
        self.map
            .entry(record.key.clone())
            .or_default()
            .insert(record.process_name.clone(), record);
    }

    /// All process entries for a key.
    pub fn get_key(&self, key: &str) -> Option<&HashMap<String, DatedRecord>> {
        self.map.get(key)
    }

    /// A single record by identity.
    pub fn get(&self, key: &str, process_name: &str) -> Option<&DatedRecord> {
        self.map.get(key)?.get(process_name)
    }

    /// Latest version stored for an identity, 0 when absent.
    pub fn version_of(&self, key: &str, process_name: &str) -> Version {
        self.get(key, process_name).map(|r| r.version).unwrap_or(0)
    }

    /// Number of distinct top-level keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no keys are cached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total records across all keys.
    pub fn total_records(&self) -> usize {
        self.map.values().map(HashMap::len).sum()
    }
}

/// Collection-mode cache: `key → collection → item → record`, plus the set
/// of collections already materialized from the latest table.
#[derive(Debug, Default)]
pub struct CollectionCache {
    map: HashMap<String, HashMap<String, HashMap<String, CollectionRecord>>>,
    loaded: HashSet<(String, String)>,
}

impl CollectionCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a record, replacing any previous entry for its identity.
    pub fn insert(&mut self, record: CollectionRecord) {
        self.map
            .entry(record.key.clone())
            .or_default()
            .entry(record.collection_name.clone())
            .or_default()
            .insert(record.item_name.clone(), record);
    }

    /// All collections for a key.
    pub fn get_key(
        &self,
        key: &str,
    ) -> Option<&HashMap<String, HashMap<String, CollectionRecord>>> {
        self.map.get(key)
    }

    /// All items in one collection.
    pub fn get_collection(
        &self,
        key: &str,
        collection_name: &str,
    ) -> Option<&HashMap<String, CollectionRecord>> {
        self.map.get(key)?.get(collection_name)
    }

    /// A single record by identity triple.
    pub fn get_item(
        &self,
        key: &str,
        collection_name: &str,
        item_name: &str,
    ) -> Option<&CollectionRecord> {
        self.map.get(key)?.get(collection_name)?.get(item_name)
    }

    /// Latest version stored for an identity triple, 0 when absent.
    pub fn version_of(&self, key: &str, collection_name: &str, item_name: &str) -> Version {
        self.get_item(key, collection_name, item_name)
            .map(|r| r.version)
            .unwrap_or(0)
    }

    /// Whether a collection has been materialized from the latest table.
    /// Once loaded, it stays resident for the instance's lifetime.
    pub fn is_loaded(&self, key: &str, collection_name: &str) -> bool {
        self.loaded
            .contains(&(key.to_string(), collection_name.to_string()))
    }

    /// Marks a collection as materialized.
    pub fn mark_loaded(&mut self, key: &str, collection_name: &str) {
        self.loaded
            .insert((key.to_string(), collection_name.to_string()));
    }

    /// Number of distinct top-level keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no keys are cached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OpKind;
    use crate::timestamp::now_utc;

    fn dated(key: &str, process: &str, version: Version) -> DatedRecord {
        DatedRecord {
            op: OpKind::Put,
            updated_at: now_utc(),
            key: key.to_string(),
            process_name: process.to_string(),
            data: serde_json::Map::new(),
            timestamp: None,
            status: None,
            status_int: None,
            username: None,
            version,
            extras: Default::default(),
        }
    }

    #[test]
    fn insert_replaces_per_identity() {
        let mut cache = DatedCache::new();
        cache.insert(dated("task", "w1", 1));
        cache.insert(dated("task", "w1", 2));
        cache.insert(dated("task", "w2", 1));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_records(), 2);
        assert_eq!(cache.version_of("task", "w1"), 2);
        assert_eq!(cache.version_of("task", "w2"), 1);
        assert_eq!(cache.version_of("task", "w3"), 0);
    }
}
