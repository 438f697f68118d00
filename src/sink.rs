//! Downstream Sinks
//!
//! The publisher hands every complete entry, in commit order, to a `Sink`.
//! Delivery is at-least-once: after a restart the last unconfirmed entry may
//! be delivered again.
//!
//! Implementations:
//! - `LogSink`: Logs each entry through `tracing`
//! - `FileSink`: Appends length-prefixed records to a local file
//! - `MemorySink`: Records deliveries for tests and DST (supports fault injection)

use crate::codec::{decode_commit_ts, decode_entry, encode_commit_ts, encode_entry, CodecError, Entry, KEY_SIZE};
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Error type for sink delivery
#[derive(Debug)]
pub enum SinkError {
    /// I/O error writing to the destination
    Io(std::io::Error),
    /// Entry could not be encoded or a stored record decoded
    Codec(CodecError),
    /// Destination refused the entry
    Rejected(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "sink I/O error: {}", e),
            SinkError::Codec(e) => write!(f, "sink codec error: {}", e),
            SinkError::Rejected(msg) => write!(f, "sink rejected entry: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

impl From<CodecError> for SinkError {
    fn from(e: CodecError) -> Self {
        SinkError::Codec(e)
    }
}

/// Destination for published entries
pub trait Sink: Send + Sync + 'static {
    /// Deliver one entry. Returns once the destination has accepted it.
    fn deliver<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

impl<K: Sink> Sink for Arc<K> {
    fn deliver<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        (**self).deliver(entry)
    }
}

// ============================================================================
// LogSink
// ============================================================================

/// Sink that logs every entry at info level
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn deliver<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                commit_ts = entry.commit_ts,
                producer = %entry.producer_id,
                bytes = entry.payload.len(),
                "entry published"
            );
            Ok(())
        })
    }
}

// ============================================================================
// FileSink
// ============================================================================

/// Appends each entry as `key (8) | len u32 LE | framed record`.
pub struct FileSink {
    path: PathBuf,
    sync: bool,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSink {
    /// Open (or create) the output file for appending.
    pub async fn open(path: impl Into<PathBuf>, sync: bool) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(FileSink {
            path,
            sync,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every complete record. A torn final record is ignored.
    pub fn read_all(path: &Path) -> Result<Vec<Entry>, SinkError> {
        let data = std::fs::read(path)?;
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset + KEY_SIZE + 4 <= data.len() {
            let commit_ts = decode_commit_ts(&data[offset..offset + KEY_SIZE])?;
            let len_start = offset + KEY_SIZE;
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&data[len_start..len_start + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let body_start = len_start + 4;
            if body_start + len > data.len() {
                break;
            }
            entries.push(decode_entry(commit_ts, &data[body_start..body_start + len])?);
            offset = body_start + len;
        }
        Ok(entries)
    }
}

impl Sink for FileSink {
    fn deliver<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let record = encode_entry(entry)?;
            let mut buf = Vec::with_capacity(KEY_SIZE + 4 + record.len());
            buf.extend_from_slice(&encode_commit_ts(entry.commit_ts));
            buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
            buf.extend_from_slice(&record);

            let mut file = self.file.lock().await;
            file.write_all(&buf).await?;
            if self.sync {
                file.sync_data().await?;
            } else {
                file.flush().await?;
            }
            Ok(())
        })
    }
}

// ============================================================================
// MemorySink
// ============================================================================

#[derive(Default)]
struct MemorySinkState {
    delivered: Vec<Entry>,
    attempts: u64,
    fail_next: u64,
}

/// Sink that keeps every delivered entry in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<Entry> {
        self.state.lock().delivered.clone()
    }

    pub fn commit_timestamps(&self) -> Vec<i64> {
        self.state.lock().delivered.iter().map(|e| e.commit_ts).collect()
    }

    /// Delivery attempts, failed ones included
    pub fn attempts(&self) -> u64 {
        self.state.lock().attempts
    }

    /// Make the next `n` deliveries fail
    pub fn fail_next(&self, n: u64) {
        self.state.lock().fail_next = n;
    }
}

impl Sink for MemorySink {
    fn deliver<'a>(
        &'a self,
        entry: &'a Entry,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(SinkError::Rejected(format!(
                    "injected failure at commit ts {}",
                    entry.commit_ts
                )));
            }
            state.delivered.push(entry.clone());
            Ok(())
        })
    }
}
