//! Key-value persistence backend trait and the in-memory implementation.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use shopsync_common::{Error, Result};

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        namespace: String,
        key: String,
        value: Value,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

/// Writes applied atomically by [`KvBackend::commit`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put of any serializable value.
    pub fn put<T: Serialize + ?Sized>(
        &mut self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<&mut Self> {
        let value = serde_json::to_value(value)?;
        self.ops.push(WriteOp::Put {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(self)
    }

    /// Stage a delete. Deleting an absent key is not an error.
    pub fn delete(&mut self, namespace: &str, key: &str) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consume the batch into its operations, in staging order.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Durable key-value engine backing the local store and the sync queue.
///
/// Keys are grouped into namespaces; values are JSON documents.
/// Implementations must make each [`commit`](KvBackend::commit) atomic and
/// must survive process restart if they claim durability.
pub trait KvBackend: Send + Sync {
    /// Get the backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Read one value.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Enumerate a whole namespace, ordered by key.
    fn scan(&self, namespace: &str) -> Result<Vec<(String, Value)>>;

    /// Apply a batch of writes atomically.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Remove every key in a namespace.
    fn clear(&self, namespace: &str) -> Result<()>;

    /// Write a single value.
    fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(namespace, key, &value)?;
        self.commit(batch)
    }

    /// Delete a single value, succeeding if absent.
    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(namespace, key);
        self.commit(batch)
    }
}

/// In-memory backend.
///
/// Useful for testing and for ephemeral sessions. All data is lost on drop.
#[derive(Default)]
pub struct MemoryBackend {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("Memory backend lock poisoned".to_string())
}

impl KvBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let namespaces = self.namespaces.read().map_err(poisoned)?;
        Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let namespaces = self.namespaces.read().map_err(poisoned)?;
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(poisoned)?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    namespaces.entry(namespace).or_default().insert(key, value);
                }
                WriteOp::Delete { namespace, key } => {
                    if let Some(ns) = namespaces.get_mut(&namespace) {
                        ns.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(poisoned)?;
        namespaces.remove(namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        backend.put("ns", "a", json!({"x": 1})).unwrap();

        assert_eq!(backend.get("ns", "a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(backend.get("other", "a").unwrap(), None);

        backend.delete("ns", "a").unwrap();
        backend.delete("ns", "a").unwrap();
        assert_eq!(backend.get("ns", "a").unwrap(), None);
    }

    #[test]
    fn test_batch_spans_namespaces() {
        let backend = MemoryBackend::new();
        backend.put("queue", "op1", json!(1)).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("records", "r1", &json!({"id": "r1"})).unwrap();
        batch.delete("queue", "op1");
        assert_eq!(batch.len(), 2);
        backend.commit(batch).unwrap();

        assert!(backend.get("queue", "op1").unwrap().is_none());
        assert!(backend.get("records", "r1").unwrap().is_some());
    }

    #[test]
    fn test_scan_is_ordered_and_clear() {
        let backend = MemoryBackend::new();
        backend.put("ns", "b", json!(2)).unwrap();
        backend.put("ns", "a", json!(1)).unwrap();

        let keys: Vec<String> = backend.scan("ns").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);

        backend.clear("ns").unwrap();
        assert!(backend.scan("ns").unwrap().is_empty());
    }
}
