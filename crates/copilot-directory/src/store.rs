//! The storage interface for node records.

use crate::error::DirectoryResult;
use copilot_types::NodeRecord;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Decides the new state of one record from its current state. Returning
/// `None` leaves the store unchanged.
pub type Modify<'a> =
    Box<dyn FnOnce(Option<NodeRecord>) -> DirectoryResult<Option<NodeRecord>> + 'a>;

/// Get/save/delete access to named node records.
///
/// Every call is atomic with respect to every other handle on the same
/// storage, including handles in other processes. [`crate::NodeDirectory`]
/// routes all read-modify-write sequences through [`NodeStore::modify`].
pub trait NodeStore: Send + Sync {
    /// Load one record. `Ok(None)` when it does not exist.
    fn get(&self, name: &str) -> DirectoryResult<Option<NodeRecord>>;

    /// Insert or replace the record stored under `record.name`.
    fn save(&self, record: &NodeRecord) -> DirectoryResult<()>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, name: &str) -> DirectoryResult<bool>;

    /// Every readable record, ordered by name.
    fn list(&self) -> DirectoryResult<Vec<NodeRecord>>;

    /// Read `name`, pass it to `f` and save what `f` returns, all as one
    /// step. `f` is called exactly once unless reading fails.
    fn modify(&self, name: &str, f: Modify<'_>) -> DirectoryResult<()>;
}

/// A store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    records: Mutex<BTreeMap<String, NodeRecord>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, NodeRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, name: &str) -> DirectoryResult<Option<NodeRecord>> {
        Ok(self.records().get(name).cloned())
    }

    fn save(&self, record: &NodeRecord) -> DirectoryResult<()> {
        self.records().insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> DirectoryResult<bool> {
        Ok(self.records().remove(name).is_some())
    }

    fn list(&self) -> DirectoryResult<Vec<NodeRecord>> {
        Ok(self.records().values().cloned().collect())
    }

    fn modify(&self, name: &str, f: Modify<'_>) -> DirectoryResult<()> {
        let mut records = self.records();
        if let Some(record) = f(records.get(name).cloned())? {
            records.insert(record.name.clone(), record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copilot_types::NodeRole;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryNodeStore::new();
        assert!(store.get("a").unwrap().is_none());

        store
            .save(&NodeRecord::new("b", NodeRole::Client, "10.0.0.2", 4444))
            .unwrap();
        store
            .save(&NodeRecord::new("a", NodeRole::Server, "0.0.0.0", 4443))
            .unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().role, NodeRole::Server);

        let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_modify() {
        let store = MemoryNodeStore::new();
        store
            .modify(
                "m",
                Box::new(|current: Option<NodeRecord>| {
                    assert!(current.is_none());
                    Ok(Some(NodeRecord::new("m", NodeRole::Client, "h", 1)))
                }),
            )
            .unwrap();
        store.modify("m", Box::new(|_: Option<NodeRecord>| Ok(None))).unwrap();
        assert_eq!(store.get("m").unwrap().unwrap().port, 1);
    }
}
