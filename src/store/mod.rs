//! Namespaced Ordered Key-Value Store
//!
//! All persistent state (entries, window bounds, save point) lives in a
//! `Store`: a set of named namespaces, each an ordered map of byte keys to
//! byte values. Writes are applied through atomic `WriteBatch`es.
//!
//! Implementations:
//! - `InMemoryStore`: For unit tests and DST (supports crash simulation)
//! - `FileStore`: Crash-durable local store (checksummed append-only log)
//! - `SimulatedStore`: Fault-injecting wrapper for DST
//!
//! ## Scans
//!
//! `Store::scan` returns a lazy iterator that fetches one page at a time
//! through `scan_page`. No lock is held between pages, so a long scan never
//! blocks writers; dropping the iterator stops the scan.

pub mod file;
pub mod memory;
pub mod simulated;

pub use file::FileStore;
pub use memory::InMemoryStore;
pub use simulated::{SimulatedStore, SimulatedStoreConfig, SimulatedStoreStats};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Error as IoError;
use std::ops::Bound;

/// Default number of records fetched per scan page
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 256;

/// A (key, value) pair returned by scans
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Error type for store operations
#[derive(Debug)]
pub enum StoreError {
    /// I/O error from the backing medium
    Io(IoError),
    /// Persistent data failed validation
    Corruption(String),
    /// Namespace was not declared when the store was opened
    UnknownNamespace(String),
    /// Store has been closed
    Closed,
    /// Fault injected by a simulated store
    Injected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "store I/O error: {}", e),
            StoreError::Corruption(msg) => write!(f, "store corruption: {}", msg),
            StoreError::UnknownNamespace(ns) => write!(f, "unknown namespace: {}", ns),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::Injected(msg) => write!(f, "injected store fault: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        StoreError::Io(e)
    }
}

/// Namespace names for one cluster.
///
/// Derived once from the cluster id and handed to every component that
/// touches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
    /// Window bounds (`lower`, `upper`)
    pub window: String,
    /// Entries keyed by encoded commit timestamp
    pub entries: String,
    /// Publisher save point
    pub savepoint: String,
}

impl Namespaces {
    pub fn for_cluster(cluster_id: u64) -> Self {
        Namespaces {
            window: format!("meta_{}", cluster_id),
            entries: format!("binlog_{}", cluster_id),
            savepoint: format!("savepoint_{}", cluster_id),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.window, &self.entries, &self.savepoint]
    }
}

/// A single mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        namespace: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        namespace: String,
        key: Vec<u8>,
    },
}

impl BatchOp {
    pub fn namespace(&self) -> &str {
        match self {
            BatchOp::Put { namespace, .. } | BatchOp::Delete { namespace, .. } => namespace,
        }
    }
}

/// Set of mutations applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch { ops: Vec::new() }
    }

    pub fn put(&mut self, namespace: &str, key: &[u8], value: &[u8]) -> &mut Self {
        self.ops.push(BatchOp::Put {
            namespace: namespace.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self
    }

    pub fn delete(&mut self, namespace: &str, key: &[u8]) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_vec(),
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Namespaced ordered key-value store
pub trait Store: Send + Sync + 'static {
    /// Apply every operation in the batch, durably and atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Read a single key.
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Fetch up to `limit` pairs in increasing key order, starting at `from`.
    fn scan_page(
        &self,
        namespace: &str,
        from: Bound<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvPair>, StoreError>;

    /// Flush any buffered writes to durable storage.
    fn sync(&self) -> Result<(), StoreError>;

    /// Close the store. Subsequent operations fail with `StoreError::Closed`.
    fn close(&self) -> Result<(), StoreError>;

    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(namespace, key, value);
        self.write_batch(batch)
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(namespace, key);
        self.write_batch(batch)
    }

    /// Lazily iterate a namespace from the first key `>= start`.
    fn scan<'a>(&'a self, namespace: &str, start: &[u8]) -> Scan<'a, Self>
    where
        Self: Sized,
    {
        Scan::new(self, namespace, start, DEFAULT_SCAN_PAGE_SIZE)
    }
}

impl<S: Store> Store for std::sync::Arc<S> {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(namespace, key)
    }

    fn scan_page(
        &self,
        namespace: &str,
        from: Bound<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvPair>, StoreError> {
        (**self).scan_page(namespace, from, limit)
    }

    fn sync(&self) -> Result<(), StoreError> {
        (**self).sync()
    }

    fn close(&self) -> Result<(), StoreError> {
        (**self).close()
    }
}

enum ScanCursor {
    From(Vec<u8>),
    After(Vec<u8>),
    Done,
}

/// Lazy, paged scan over one namespace.
///
/// Yields pairs in increasing key order. A failed page fetch yields the
/// error once and ends the scan.
pub struct Scan<'a, S: Store + ?Sized> {
    store: &'a S,
    namespace: String,
    cursor: ScanCursor,
    page_size: usize,
    buffer: VecDeque<KvPair>,
    exhausted: bool,
}

impl<'a, S: Store + ?Sized> Scan<'a, S> {
    pub fn new(store: &'a S, namespace: &str, start: &[u8], page_size: usize) -> Self {
        debug_assert!(page_size > 0, "Precondition: page size must be positive");
        Scan {
            store,
            namespace: namespace.to_string(),
            cursor: ScanCursor::From(start.to_vec()),
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Key of the last pair handed out, if any
    pub fn position(&self) -> Option<&[u8]> {
        match &self.cursor {
            ScanCursor::After(key) => Some(key),
            _ => None,
        }
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let from = match &self.cursor {
            ScanCursor::From(key) => Bound::Included(key.as_slice()),
            ScanCursor::After(key) => Bound::Excluded(key.as_slice()),
            ScanCursor::Done => return Ok(()),
        };
        let page = self.store.scan_page(&self.namespace, from, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: Store + ?Sized> Iterator for Scan<'_, S> {
    type Item = Result<KvPair, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.cursor, ScanCursor::Done) {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.cursor = ScanCursor::Done;
                return Some(Err(e));
            }
        }
        match self.buffer.pop_front() {
            Some((key, value)) => {
                self.cursor = ScanCursor::After(key.clone());
                Some(Ok((key, value)))
            }
            None => {
                self.cursor = ScanCursor::Done;
                None
            }
        }
    }
}
