//! Node records kept under `"nodes"` in the `core.json` document.
//!
//! The file is re-read on every operation and written back whole, so edits
//! made by other tools between calls are picked up. Top-level keys other
//! than `"nodes"`, unknown record fields, and records that fail to parse are
//! all preserved on save.
//!
//! Writers hold an exclusive OS lock on `<document>.lock` for the whole
//! read-modify-write, so a CLI process and a running daemon never lose each
//! other's changes. Readers rely on the write being a rename.

use crate::error::{DirectoryError, DirectoryResult};
use crate::store::{Modify, NodeStore};
use copilot_types::NodeRecord;
use fs4::fs_std::FileExt;
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const NODES_KEY: &str = "nodes";

/// Node records stored in a JSON document on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes access to the document within this process.
    local_lock: Mutex<()>,
}

/// Exclusive access to the document, released on drop.
struct DocumentLock<'a> {
    _local: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for DocumentLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "Could not release node document lock");
        }
    }
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn invalid(&self, reason: impl Into<String>) -> DirectoryError {
        DirectoryError::InvalidDocument {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Load the whole document. A missing or empty file is an empty document.
    fn read_document(&self) -> DirectoryResult<Map<String, Value>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(self.invalid("top level is not an object")),
        }
    }

    /// `<document><suffix>`, next to the document.
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Take the in-process lock, then the OS lock shared with other processes.
    fn lock_document(&self) -> DirectoryResult<DocumentLock<'_>> {
        let local = self.local();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.sibling(".lock"))?;
        FileExt::lock_exclusive(&file)?;
        Ok(DocumentLock {
            _local: local,
            file,
        })
    }

    /// Write through a temporary file and rename it over the document. Must
    /// run under [`Self::lock_document`].
    fn write_document(&self, document: &Map<String, Value>) -> DirectoryResult<()> {
        let content = serde_json::to_string_pretty(document)?;
        let tmp = self.sibling(&format!(".{}.tmp", std::process::id()));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Node document written");
        Ok(())
    }

    fn nodes<'a>(
        &self,
        document: &'a Map<String, Value>,
    ) -> DirectoryResult<Option<&'a Map<String, Value>>> {
        match document.get(NODES_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(nodes)) => Ok(Some(nodes)),
            Some(_) => Err(self.invalid("\"nodes\" is not an object")),
        }
    }

    fn nodes_mut<'a>(
        &self,
        document: &'a mut Map<String, Value>,
    ) -> DirectoryResult<&'a mut Map<String, Value>> {
        let entry = document
            .entry(NODES_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(nodes) => Ok(nodes),
            _ => Err(self.invalid("\"nodes\" is not an object")),
        }
    }

    fn parse_record(name: &str, value: &Value) -> Option<NodeRecord> {
        match serde_json::from_value::<NodeRecord>(value.clone()) {
            Ok(mut record) => {
                record.name = name.to_string();
                Some(record)
            }
            Err(e) => {
                warn!(node = %name, error = %e, "Skipping unreadable node record");
                None
            }
        }
    }

    fn local(&self) -> MutexGuard<'_, ()> {
        self.local_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_record(
        &self,
        document: &Map<String, Value>,
        name: &str,
    ) -> DirectoryResult<Option<NodeRecord>> {
        Ok(self
            .nodes(document)?
            .and_then(|nodes| nodes.get(name))
            .and_then(|value| Self::parse_record(name, value)))
    }
}

impl NodeStore for JsonFileStore {
    fn get(&self, name: &str) -> DirectoryResult<Option<NodeRecord>> {
        let _guard = self.local();
        let document = self.read_document()?;
        self.read_record(&document, name)
    }

    fn save(&self, record: &NodeRecord) -> DirectoryResult<()> {
        let _guard = self.lock_document()?;
        let mut document = self.read_document()?;
        let value = serde_json::to_value(record)?;
        self.nodes_mut(&mut document)?
            .insert(record.name.clone(), value);
        self.write_document(&document)
    }

    fn delete(&self, name: &str) -> DirectoryResult<bool> {
        let _guard = self.lock_document()?;
        let mut document = self.read_document()?;
        let removed = self.nodes_mut(&mut document)?.remove(name).is_some();
        if removed {
            self.write_document(&document)?;
        }
        Ok(removed)
    }

    fn list(&self) -> DirectoryResult<Vec<NodeRecord>> {
        let _guard = self.local();
        let document = self.read_document()?;
        let Some(nodes) = self.nodes(&document)? else {
            return Ok(Vec::new());
        };
        let mut records: Vec<NodeRecord> = nodes
            .iter()
            .filter_map(|(name, value)| Self::parse_record(name, value))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn modify(&self, name: &str, f: Modify<'_>) -> DirectoryResult<()> {
        let _guard = self.lock_document()?;
        let mut document = self.read_document()?;
        let current = self.read_record(&document, name)?;
        if let Some(record) = f(current)? {
            let value = serde_json::to_value(&record)?;
            self.nodes_mut(&mut document)?.insert(record.name.clone(), value);
            self.write_document(&document)?;
        }
        Ok(())
    }
}
