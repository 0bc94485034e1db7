//! Ordered, capacity-bounded, optionally persistent key/value store.
//!
//! Tasks live here. Order of insertion is preserved and exposed (`newest`,
//! `items_reversed`), capacity is enforced with tagged-FIFO eviction, and —
//! when a directory is configured — values are mirrored to disk so tasks
//! survive a restart.
//!
//! Concurrency follows the design document literally: one lock serializes
//! every mutation and read. The store is small and low traffic; a `Mutex`
//! around a plain in-memory structure is simpler and just as correct as a
//! sharded or lock-free alternative here.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::ConciergeError;

#[derive(Default)]
struct Metadata {
    order: Vec<String>,
    tagged: HashSet<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetadataFile {
    order: Vec<String>,
    tagged: Vec<String>,
}

struct Inner {
    values: std::collections::HashMap<String, Value>,
    meta: Metadata,
}

/// An ordered map with optional on-disk persistence and tagged-FIFO eviction.
pub struct PersistentOrderedMap {
    inner: Mutex<Inner>,
    max_size: usize,
    persist_dir: Option<PathBuf>,
}

impl PersistentOrderedMap {
    /// Creates an in-memory-only store with the given capacity (`0` = unbounded).
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: Default::default(),
                meta: Metadata::default(),
            }),
            max_size,
            persist_dir: None,
        }
    }

    /// Creates a store backed by `dir`: one file per value plus a
    /// `_metadata.json` sidecar recording order and tag state. Existing
    /// state is loaded immediately; any key in the sidecar whose value file
    /// is missing is dropped from the recovered order.
    pub fn open(dir: impl AsRef<Path>, max_size: usize) -> Result<Self, ConciergeError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join("_metadata.json");
        let meta_file: MetadataFile = if meta_path.exists() {
            serde_json::from_slice(&fs::read(&meta_path)?)?
        } else {
            MetadataFile::default()
        };

        let mut values = std::collections::HashMap::new();
        let mut order = Vec::new();
        for key in meta_file.order {
            let value_path = dir.join(format!("{key}.json"));
            if value_path.exists() {
                let value: Value = serde_json::from_slice(&fs::read(&value_path)?)?;
                values.insert(key.clone(), value);
                order.push(key);
            }
        }
        let tagged: HashSet<String> = meta_file.tagged.into_iter().filter(|k| values.contains_key(k)).collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                values,
                meta: Metadata { order, tagged },
            }),
            max_size,
            persist_dir: Some(dir),
        })
    }

    /// Inserts or updates `key`. Updating an existing key never evicts and
    /// clears any eviction tag on it. Inserting a new key at capacity evicts
    /// the oldest tagged key, or fails with [`ConciergeError::FullCapacity`]
    /// if none is tagged.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ConciergeError> {
        let mut guard = self.inner.lock().expect("store lock poisoned");

        let is_new = !guard.values.contains_key(key);
        if is_new && self.max_size > 0 && guard.meta.order.len() >= self.max_size {
            let evictee = guard
                .meta
                .order
                .iter()
                .find(|k| guard.meta.tagged.contains(*k))
                .cloned();
            match evictee {
                Some(evictee) => {
                    guard.values.remove(&evictee);
                    guard.meta.tagged.remove(&evictee);
                    guard.meta.order.retain(|k| k != &evictee);
                    self.persist_remove(&evictee)?;
                }
                None => return Err(ConciergeError::FullCapacity),
            }
        }

        if is_new {
            guard.meta.order.push(key.to_string());
        } else {
            guard.meta.tagged.remove(key);
        }
        guard.values.insert(key.to_string(), value.clone());

        self.persist_value(key, &value)?;
        self.persist_metadata(&guard.meta)?;
        Ok(())
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        let guard = self.inner.lock().expect("store lock poisoned");
        guard.values.get(key).cloned()
    }

    /// Reads, mutates, and writes back `key` under a single lock acquisition.
    ///
    /// Used where a read-then-set would otherwise race against a concurrent
    /// update to the same key (e.g. several hosts of one async task
    /// reporting their results independently). `f` is skipped if `key` is
    /// absent.
    pub fn update<F>(&self, key: &str, f: F) -> Result<(), ConciergeError>
    where
        F: FnOnce(&mut Value),
    {
        let mut guard = self.inner.lock().expect("store lock poisoned");
        let Some(value) = guard.values.get_mut(key) else {
            return Ok(());
        };
        f(value);
        let updated = value.clone();
        self.persist_value(key, &updated)?;
        Ok(())
    }

    /// Removes `key` entirely, if present.
    pub fn delete(&self, key: &str) -> Result<(), ConciergeError> {
        let mut guard = self.inner.lock().expect("store lock poisoned");
        if guard.values.remove(key).is_none() {
            return Err(ConciergeError::KeyMissing(key.to_string()));
        }
        guard.meta.order.retain(|k| k != key);
        guard.meta.tagged.remove(key);
        self.persist_remove(key)?;
        self.persist_metadata(&guard.meta)?;
        Ok(())
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().expect("store lock poisoned").values.contains_key(key)
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").meta.order.len()
    }

    /// Whether the store currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().expect("store lock poisoned").meta.order.clone()
    }

    /// The most recently inserted-or-updated key, and its value.
    pub fn newest(&self) -> Option<(String, Value)> {
        let guard = self.inner.lock().expect("store lock poisoned");
        let key = guard.meta.order.last()?.clone();
        let value = guard.values.get(&key).cloned()?;
        Some((key, value))
    }

    /// The oldest key currently present, if any.
    pub fn oldest_key(&self) -> Option<String> {
        self.inner.lock().expect("store lock poisoned").meta.order.first().cloned()
    }

    /// All `(key, value)` pairs, newest first.
    pub fn items_reversed(&self) -> Vec<(String, Value)> {
        let guard = self.inner.lock().expect("store lock poisoned");
        guard
            .meta
            .order
            .iter()
            .rev()
            .filter_map(|k| guard.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Marks `key` as eligible for FIFO eviction under capacity pressure.
    pub fn tag_for_removal(&self, key: &str) -> Result<(), ConciergeError> {
        let mut guard = self.inner.lock().expect("store lock poisoned");
        if !guard.values.contains_key(key) {
            return Err(ConciergeError::KeyMissing(key.to_string()));
        }
        guard.meta.tagged.insert(key.to_string());
        self.persist_metadata(&guard.meta)?;
        Ok(())
    }

    fn persist_value(&self, key: &str, value: &Value) -> Result<(), ConciergeError> {
        let Some(dir) = &self.persist_dir else { return Ok(()) };
        let path = dir.join(format!("{key}.json"));
        let tmp = dir.join(format!("{key}.json.tmp"));
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn persist_remove(&self, key: &str) -> Result<(), ConciergeError> {
        let Some(dir) = &self.persist_dir else { return Ok(()) };
        let path = dir.join(format!("{key}.json"));
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn persist_metadata(&self, meta: &Metadata) -> Result<(), ConciergeError> {
        let Some(dir) = &self.persist_dir else { return Ok(()) };
        let file = MetadataFile {
            order: meta.order.clone(),
            tagged: meta.tagged.iter().cloned().collect(),
        };
        let tmp = dir.join("_metadata.json.tmp");
        let path = dir.join("_metadata.json");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_and_get_roundtrip() {
        let store = PersistentOrderedMap::new(0);
        store.set("a", json!({"x": 1})).unwrap();
        assert_eq!(store.get("a"), Some(json!({"x": 1})));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_rejects_when_nothing_tagged() {
        let store = PersistentOrderedMap::new(1);
        store.set("a", json!(1)).unwrap();
        let err = store.set("b", json!(2)).unwrap_err();
        assert!(matches!(err, ConciergeError::FullCapacity));
    }

    #[test]
    fn capacity_evicts_oldest_tagged() {
        let store = PersistentOrderedMap::new(2);
        store.set("a", json!(1)).unwrap();
        store.set("b", json!(2)).unwrap();
        store.tag_for_removal("a").unwrap();
        store.set("c", json!(3)).unwrap();
        assert!(!store.contains("a"));
        assert!(store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn update_clears_tag_and_never_evicts() {
        let store = PersistentOrderedMap::new(1);
        store.set("a", json!(1)).unwrap();
        store.tag_for_removal("a").unwrap();
        store.set("a", json!(2)).unwrap();
        store.set("b", json!(3)).unwrap_err();
        assert_eq!(store.get("a"), Some(json!(2)));
    }

    #[test]
    fn items_reversed_is_newest_first() {
        let store = PersistentOrderedMap::new(0);
        store.set("a", json!(1)).unwrap();
        store.set("b", json!(2)).unwrap();
        let items = store.items_reversed();
        assert_eq!(items[0].0, "b");
        assert_eq!(items[1].0, "a");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PersistentOrderedMap::open(dir.path(), 0).unwrap();
            store.set("a", json!({"hello": "world"})).unwrap();
        }
        let reopened = PersistentOrderedMap::open(dir.path(), 0).unwrap();
        assert_eq!(reopened.get("a"), Some(json!({"hello": "world"})));
        assert_eq!(reopened.keys(), vec!["a".to_string()]);
    }
}
