//! Crash-durable local store.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (8 bytes)                 │
//! │ - magic: "CSTS" (4 bytes)        │
//! │ - version: u8                    │
//! │ - reserved: 3 bytes              │
//! ├──────────────────────────────────┤
//! │ Record 0 (one WriteBatch)        │
//! │ - body_length: u32 LE            │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - body: bincode(WriteBatch)      │
//! ├──────────────────────────────────┤
//! │ Record 1 ...                     │
//! └──────────────────────────────────┘
//! ```
//!
//! Each batch is one record, so a batch is either fully replayed or not at
//! all. On open the log is replayed into an ordered in-memory index; replay
//! stops at the first truncated or corrupt record and the torn tail is cut
//! off before new records are appended.

use super::{BatchOp, KvPair, Store, StoreError, WriteBatch};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Store file magic number
pub const STORE_MAGIC: [u8; 4] = *b"CSTS";
/// Current store file version
pub const STORE_VERSION: u8 = 1;
/// Header size in bytes
pub const STORE_HEADER_SIZE: usize = 8;
/// Record overhead: body_length(4) + checksum(4)
pub const RECORD_OVERHEAD: usize = 8;
/// Name of the log file inside the data directory
pub const STORE_FILE_NAME: &str = "data.store";

type Tables = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

struct LogFile {
    file: File,
    len: u64,
}

/// Local store backed by a checksummed append-only log
pub struct FileStore {
    path: PathBuf,
    log: Mutex<LogFile>,
    tables: RwLock<Tables>,
    sync_writes: bool,
    closed: AtomicBool,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl FileStore {
    /// Open (or create) the store under `dir`, declaring its namespaces.
    ///
    /// `sync_writes` fsyncs every batch before it is acknowledged.
    pub fn open(dir: &Path, namespaces: &[&str], sync_writes: bool) -> Result<Self, StoreError> {
        create_data_dir(dir)?;
        let path = dir.join(STORE_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut tables: Tables = HashMap::new();
        let len = if data.is_empty() {
            let mut header = [0u8; STORE_HEADER_SIZE];
            header[0..4].copy_from_slice(&STORE_MAGIC);
            header[4] = STORE_VERSION;
            file.write_all(&header)?;
            file.sync_all()?;
            STORE_HEADER_SIZE as u64
        } else {
            let (valid_len, records) = replay(&data, &mut tables)?;
            if valid_len < data.len() {
                warn!(
                    "Store log {} has a torn tail: keeping {} of {} bytes",
                    path.display(),
                    valid_len,
                    data.len()
                );
                file.set_len(valid_len as u64)?;
                file.sync_all()?;
            }
            info!(
                "Store log {} replayed: {} batches",
                path.display(),
                records
            );
            valid_len as u64
        };
        file.seek(SeekFrom::Start(len))?;

        for ns in namespaces {
            tables.entry(ns.to_string()).or_default();
        }

        Ok(FileStore {
            path,
            log: Mutex::new(LogFile { file, len }),
            tables: RwLock::new(tables),
            sync_writes,
            closed: AtomicBool::new(false),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
fn create_data_dir(dir: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(StoreError::Io)
}

#[cfg(not(unix))]
fn create_data_dir(dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(StoreError::Io)
}

/// Replay every intact record. Returns the length of the valid prefix.
fn replay(data: &[u8], tables: &mut Tables) -> Result<(usize, usize), StoreError> {
    if data.len() < STORE_HEADER_SIZE {
        return Err(StoreError::Corruption(
            "store file too short for header".to_string(),
        ));
    }
    if data[0..4] != STORE_MAGIC {
        return Err(StoreError::Corruption(format!(
            "invalid store magic: {:?}",
            &data[0..4]
        )));
    }
    if data[4] != STORE_VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported store version: {}",
            data[4]
        )));
    }

    let mut offset = STORE_HEADER_SIZE;
    let mut records = 0;
    while let Some((batch, size)) = decode_record(&data[offset..]) {
        apply(tables, batch.ops(), true);
        offset += size;
        records += 1;
    }
    Ok((offset, records))
}

fn encode_record(batch: &WriteBatch) -> Result<Vec<u8>, StoreError> {
    let body = bincode::serialize(batch)
        .map_err(|e| StoreError::Corruption(format!("serialize batch: {}", e)))?;
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode one record. Returns None if truncated or corrupt.
fn decode_record(data: &[u8]) -> Option<(WriteBatch, usize)> {
    if data.len() < RECORD_OVERHEAD {
        return None;
    }
    let body_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let total = RECORD_OVERHEAD.checked_add(body_len)?;
    if data.len() < total {
        return None;
    }
    let body = &data[RECORD_OVERHEAD..total];
    if crc32fast::hash(body) != checksum {
        return None;
    }
    let batch = bincode::deserialize(body).ok()?;
    Some((batch, total))
}

fn apply(tables: &mut Tables, ops: &[BatchOp], create_missing: bool) {
    for op in ops {
        match op {
            BatchOp::Put {
                namespace,
                key,
                value,
            } => {
                let table = if create_missing {
                    Some(tables.entry(namespace.clone()).or_default())
                } else {
                    tables.get_mut(namespace)
                };
                if let Some(table) = table {
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

impl Store for FileStore {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_open()?;
        if batch.is_empty() {
            return Ok(());
        }
        {
            let tables = self.tables.read();
            if let Some(op) = batch
                .ops()
                .iter()
                .find(|op| !tables.contains_key(op.namespace()))
            {
                return Err(StoreError::UnknownNamespace(op.namespace().to_string()));
            }
        }

        let record = encode_record(&batch)?;

        // Hold the log lock while applying so index order matches log order
        let mut log = self.log.lock();
        let written = log.file.write_all(&record).and_then(|_| {
            if self.sync_writes {
                log.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            // Cut off whatever part of the record reached the file
            let len = log.len;
            let _ = log.file.set_len(len);
            let _ = log.file.seek(SeekFrom::Start(len));
            return Err(StoreError::Io(e));
        }
        log.len += record.len() as u64;

        apply(&mut self.tables.write(), batch.ops(), false);
        Ok(())
    }

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let tables = self.tables.read();
        let table = tables
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
        self.check_open()?;
        let tables = self.tables.read();
        let table = tables
            .get(namespace)
            .ok_or_else(|| StoreError::UnknownNamespace(namespace.to_string()))?;
        Ok(table
            .range::<[u8], _>((from, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.check_open()?;
        self.log.lock().file.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.log.lock().file.sync_all()?;
        info!("Store {} closed", self.path.display());
        Ok(())
    }
}
