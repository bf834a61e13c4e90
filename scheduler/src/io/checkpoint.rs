//! Checkpoint store: one isolated key-value namespace per task name.
//!
//! Units reach the store only through [`TaskCheckpoint`], which is bound to
//! the namespace of the task that owns the executing call. There is no TTL
//! and no multi-key transaction: a unit that needs several fields updated
//! together stores them as one structured value under one key.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Backend for checkpoint records.
pub trait CheckpointStore: Send {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;
    fn put(&mut self, namespace: &str, key: &str, value: Value) -> Result<()>;
    /// Returns whether a value was present.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<bool>;
    fn entries(&self, namespace: &str) -> Result<BTreeMap<String, Value>>;
}

/// Namespace-scoped view handed to an executing unit.
pub struct TaskCheckpoint<'a> {
    store: &'a mut dyn CheckpointStore,
    namespace: &'a str,
}

impl<'a> TaskCheckpoint<'a> {
    pub fn new(store: &'a mut dyn CheckpointStore, namespace: &'a str) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &str {
        self.namespace
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.store.get(self.namespace, key)
    }

    pub fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.store.put(self.namespace, key, value)
    }

    pub fn delete(&mut self, key: &str) -> Result<bool> {
        self.store.delete(self.namespace, key)
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, Value>> {
        self.store.entries(self.namespace)
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    namespaces: HashMap<String, BTreeMap<String, Value>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&mut self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .namespaces
            .get_mut(namespace)
            .and_then(|entries| entries.remove(key))
            .is_some())
    }

    fn entries(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        Ok(self.namespaces.get(namespace).cloned().unwrap_or_default())
    }
}

/// On-disk layout of one namespace file.
#[derive(Debug, Serialize, Deserialize)]
struct NamespaceFile {
    namespace: String,
    entries: BTreeMap<String, Value>,
}

/// Durable store: one JSON file per namespace under `dir`.
///
/// File names are the hex SHA-256 of the namespace so any task name maps to a
/// safe, fixed-length file name; the namespace itself is stored inside.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        namespace_path(&self.dir, namespace)
    }

    fn load(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        let path = self.namespace_path(namespace);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        let file: NamespaceFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        if file.namespace != namespace {
            return Err(anyhow!(
                "checkpoint {} belongs to '{}', expected '{}'",
                path.display(),
                file.namespace,
                namespace
            ));
        }
        Ok(file.entries)
    }

    fn store(&self, namespace: &str, entries: BTreeMap<String, Value>) -> Result<()> {
        let path = self.namespace_path(namespace);
        debug!(namespace, keys = entries.len(), path = %path.display(), "writing checkpoint");
        let file = NamespaceFile {
            namespace: namespace.to_string(),
            entries,
        };
        let mut buf = serde_json::to_string_pretty(&file)?;
        buf.push('\n');
        super::write_atomic(&path, &buf)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.load(namespace)?.remove(key))
    }

    fn put(&mut self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut entries = self.load(namespace)?;
        entries.insert(key.to_string(), value);
        self.store(namespace, entries)
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<bool> {
        let mut entries = self.load(namespace)?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.store(namespace, entries)?;
        Ok(true)
    }

    fn entries(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        self.load(namespace)
    }
}

fn namespace_path(dir: &Path, namespace: &str) -> PathBuf {
    let digest = Sha256::digest(namespace.as_bytes());
    dir.join(format!("{}.json", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise_isolation(store: &mut dyn CheckpointStore) {
        store.put("A", "k", json!("v1")).expect("put a");
        store.put("B", "k", json!("v2")).expect("put b");
        assert_eq!(store.get("A", "k").expect("get"), Some(json!("v1")));
        assert_eq!(store.get("B", "k").expect("get"), Some(json!("v2")));

        assert!(store.delete("B", "k").expect("delete"));
        assert!(!store.delete("B", "k").expect("delete again"));
        assert_eq!(store.get("A", "k").expect("get"), Some(json!("v1")));
        assert_eq!(store.get("B", "k").expect("get"), None);
    }

    #[test]
    fn memory_namespaces_are_isolated() {
        let mut store = MemoryCheckpointStore::new();
        exercise_isolation(&mut store);
    }

    #[test]
    fn file_namespaces_are_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = FileCheckpointStore::new(temp.path());
        exercise_isolation(&mut store);
    }

    #[test]
    fn file_store_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let mut store = FileCheckpointStore::new(temp.path());
            store
                .put("batch/job", "pos", json!({"pos": 40, "total": 100}))
                .expect("put");
        }
        let store = FileCheckpointStore::new(temp.path());
        assert_eq!(
            store.get("batch/job", "pos").expect("get"),
            Some(json!({"pos": 40, "total": 100}))
        );
    }

    #[test]
    fn task_checkpoint_is_bound_to_its_namespace() {
        let mut store = MemoryCheckpointStore::new();
        store.put("other", "pos", json!(99)).expect("seed");
        {
            let mut handle = TaskCheckpoint::new(&mut store, "mine");
            assert_eq!(handle.get("pos").expect("get"), None);
            handle.put("pos", json!(1)).expect("put");
            assert_eq!(handle.snapshot().expect("snapshot").len(), 1);
        }
        assert_eq!(store.get("other", "pos").expect("get"), Some(json!(99)));
        assert_eq!(store.get("mine", "pos").expect("get"), Some(json!(1)));
    }
}
