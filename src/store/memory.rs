//! In-memory store for unit tests and deterministic simulation.
//!
//! Tracks a durable image next to the live one so tests can simulate a
//! crash: `simulate_crash()` discards every write that was not synced.

use super::{BatchOp, KvPair, Store, StoreError, WriteBatch};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

type Tables = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Debug, Default)]
struct MemoryState {
    live: Tables,
    durable: Tables,
    closed: bool,
}

/// In-memory store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    sync_on_write: bool,
}

impl InMemoryStore {
    /// Create a store whose writes are durable as soon as they return
    pub fn new(namespaces: &[&str]) -> Self {
        Self::build(namespaces, true)
    }

    /// Create a store whose writes are only durable after `sync()`
    pub fn unsynced(namespaces: &[&str]) -> Self {
        Self::build(namespaces, false)
    }

    fn build(namespaces: &[&str], sync_on_write: bool) -> Self {
        let tables: Tables = namespaces
            .iter()
            .map(|ns| (ns.to_string(), BTreeMap::new()))
            .collect();
        InMemoryStore {
            state: Arc::new(RwLock::new(MemoryState {
                live: tables.clone(),
                durable: tables,
                closed: false,
            })),
            sync_on_write,
        }
    }

    /// Simulate a crash: un-synced writes are lost and the store reopens.
    pub fn simulate_crash(&self) {
        let mut state = self.state.write();
        state.live = state.durable.clone();
        state.closed = false;
    }

    /// Number of keys in a namespace (for testing)
    pub fn len(&self, namespace: &str) -> usize {
        self.state
            .read()
            .live
            .get(namespace)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    /// Overwrite a raw value without going through a batch (for corruption tests)
    pub fn poke(&self, namespace: &str, key: &[u8], value: &[u8]) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        for tables in [&mut state.live, &mut state.durable] {
            if let Some(table) = tables.get_mut(namespace) {
                table.insert(key.to_vec(), value.to_vec());
            }
        }
    }
}

fn apply(tables: &mut Tables, ops: &[BatchOp]) {
    for op in ops {
        match op {
            BatchOp::Put {
                namespace,
                key,
                value,
            } => {
                if let Some(table) = tables.get_mut(namespace) {
                    table.insert(key.clone(), value.clone());
                }
            }
            BatchOp::Delete { namespace, key } => {
                if let Some(table) = tables.get_mut(namespace) {
                    table.remove(key);
                }
            }
        }
    }
}

impl Store for InMemoryStore {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::Closed);
        }
        // Validate before applying anything so the batch stays atomic
        if let Some(op) = batch
            .ops()
            .iter()
            .find(|op| !state.live.contains_key(op.namespace()))
        {
            return Err(StoreError::UnknownNamespace(op.namespace().to_string()));
        }

        apply(&mut state.live, batch.ops());
        if self.sync_on_write {
            apply(&mut state.durable, batch.ops());
        }
        Ok(())
    }

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state.read();
        if state.closed {
            return Err(StoreError::Closed);
        }
        let table = state
            .live
            .get(namespace)
            .ok_or_else(|| StoreError::UnknownNamespace(namespace.to_string()))?;
        Ok(table.get(key).cloned())
    }

    fn scan_page(
        &self,
        namespace: &str,
        from: Bound<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvPair>, StoreError> {
        let state = self.state.read();
        if state.closed {
            return Err(StoreError::Closed);
        }
        let table = state
            .live
            .get(namespace)
            .ok_or_else(|| StoreError::UnknownNamespace(namespace.to_string()))?;
        Ok(table
            .range::<[u8], _>((from, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn sync(&self) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(StoreError::Closed);
        }
        state.durable = state.live.clone();
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.state.write().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = InMemoryStore::new(&["a"]);
        store.put("a", b"k", b"v").unwrap();
        assert_eq!(store.get("a", b"k").unwrap(), Some(b"v".to_vec()));
        store.delete("a", b"k").unwrap();
        assert_eq!(store.get("a", b"k").unwrap(), None);
    }

    #[test]
    fn test_batch_is_atomic_on_unknown_namespace() {
        let store = InMemoryStore::new(&["a"]);
        let mut batch = WriteBatch::new();
        batch.put("a", b"k", b"v").put("nope", b"k", b"v");

        assert!(matches!(
            store.write_batch(batch),
            Err(StoreError::UnknownNamespace(ns)) if ns == "nope"
        ));
        assert_eq!(store.get("a", b"k").unwrap(), None);
    }

    #[test]
    fn test_crash_discards_unsynced_writes() {
        let store = InMemoryStore::unsynced(&["a"]);
        store.put("a", b"1", b"x").unwrap();
        store.sync().unwrap();
        store.put("a", b"2", b"y").unwrap();

        store.simulate_crash();

        assert_eq!(store.get("a", b"1").unwrap(), Some(b"x".to_vec()));
        assert_eq!(store.get("a", b"2").unwrap(), None);
    }

    #[test]
    fn test_synced_store_survives_crash() {
        let store = InMemoryStore::new(&["a"]);
        store.put("a", b"1", b"x").unwrap();
        store.simulate_crash();
        assert_eq!(store.len("a"), 1);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = InMemoryStore::new(&["a"]);
        store.close().unwrap();
        assert!(matches!(store.put("a", b"k", b"v"), Err(StoreError::Closed)));
        assert!(matches!(store.get("a", b"k"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_scan_page_bounds() {
        let store = InMemoryStore::new(&["a"]);
        for k in [1u8, 2, 3, 4] {
            store.put("a", &[k], &[]).unwrap();
        }
        let page = store
            .scan_page("a", Bound::Excluded(&[2u8][..]), 10)
            .unwrap();
        assert_eq!(page.iter().map(|(k, _)| k[0]).collect::<Vec<_>>(), vec![3, 4]);
    }
}
