//! Publisher save point: the last commit timestamp confirmed delivered
//! downstream. Monotonically non-decreasing; survives restart.

use crate::codec::{decode_commit_ts, encode_commit_ts, CodecError};
use crate::store::{Store, StoreError};
use std::sync::Arc;

const SAVEPOINT_KEY: &[u8] = b"savepoint";

/// Error type for save point operations
#[derive(Debug)]
pub enum SavePointError {
    Store(StoreError),
    Codec(CodecError),
}

impl std::fmt::Display for SavePointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SavePointError::Store(e) => write!(f, "save point store error: {}", e),
            SavePointError::Codec(e) => write!(f, "save point decode error: {}", e),
        }
    }
}

impl std::error::Error for SavePointError {}

impl From<StoreError> for SavePointError {
    fn from(e: StoreError) -> Self {
        SavePointError::Store(e)
    }
}

impl From<CodecError> for SavePointError {
    fn from(e: CodecError) -> Self {
        SavePointError::Codec(e)
    }
}

/// Persistent delivery checkpoint
pub struct SavePoint<S: Store> {
    store: Arc<S>,
    namespace: String,
    current: i64,
}

impl<S: Store> SavePoint<S> {
    /// Load the save point, falling back to `floor` when none is persisted
    pub fn open(store: Arc<S>, namespace: &str, floor: i64) -> Result<Self, SavePointError> {
        let current = match store.get(namespace, SAVEPOINT_KEY)? {
            Some(raw) => decode_commit_ts(&raw)?,
            None => floor,
        };
        Ok(SavePoint {
            store,
            namespace: namespace.to_string(),
            current,
        })
    }

    pub fn get(&self) -> i64 {
        self.current
    }

    /// Persist `ts` if it is ahead of the current save point.
    /// Returns whether anything was written.
    pub fn persist(&mut self, ts: i64) -> Result<bool, SavePointError> {
        if ts <= self.current {
            return Ok(false);
        }
        self.store
            .put(&self.namespace, SAVEPOINT_KEY, &encode_commit_ts(ts))?;
        self.current = ts;
        Ok(true)
    }
}
