//! Key and Record Encoding
//!
//! ## Commit timestamp keys
//!
//! Keys in the entries namespace are the commit timestamp encoded as 8
//! big-endian bytes with the sign bit flipped, so lexicographic byte order
//! equals numeric order (negative timestamps sort first).
//!
//! ## Entry records
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "CSTN" (4 bytes)        │
//! │ - version: u8                    │
//! │ - reserved: 3 bytes              │
//! │ - body_length: u32 LE            │
//! │ - checksum: u32 LE (CRC32)       │
//! ├──────────────────────────────────┤
//! │ Body: bincode(Entry)             │
//! └──────────────────────────────────┘
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Entry record magic number
pub const ENTRY_MAGIC: [u8; 4] = *b"CSTN";
/// Current entry record version
pub const ENTRY_VERSION: u8 = 1;
/// Record header size in bytes
pub const ENTRY_HEADER_SIZE: usize = 16;
/// Encoded commit timestamp width
pub const KEY_SIZE: usize = 8;

const SIGN_MASK: u64 = 0x8000_0000_0000_0000;

/// Identifier of an upstream producer (one per database node)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(pub String);

impl ProducerId {
    pub fn new(id: impl Into<String>) -> Self {
        ProducerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProducerId {
    fn from(s: &str) -> Self {
        ProducerId(s.to_string())
    }
}

/// A single change record, immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub commit_ts: i64,
    pub producer_id: ProducerId,
    pub payload: Bytes,
}

impl Entry {
    pub fn new(commit_ts: i64, producer_id: ProducerId, payload: impl Into<Bytes>) -> Self {
        Entry {
            commit_ts,
            producer_id,
            payload: payload.into(),
        }
    }
}

/// Error type for key and record decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Key is not exactly KEY_SIZE bytes
    InvalidKey(Vec<u8>),
    /// Record shorter than its header or declared body
    Truncated {
        commit_ts: i64,
        expected: usize,
        actual: usize,
    },
    /// Record magic does not match
    BadMagic { commit_ts: i64 },
    /// Record version is not supported
    UnsupportedVersion { commit_ts: i64, version: u8 },
    /// Body checksum mismatch
    ChecksumMismatch {
        commit_ts: i64,
        expected: u32,
        actual: u32,
    },
    /// Body failed to serialize or deserialize
    Serialization { commit_ts: i64, message: String },
    /// Record body names a different commit timestamp than its key
    KeyMismatch { key_ts: i64, record_ts: i64 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidKey(key) => {
                write!(f, "invalid commit ts key {:?}: expected {} bytes", key, KEY_SIZE)
            }
            CodecError::Truncated {
                commit_ts,
                expected,
                actual,
            } => write!(
                f,
                "entry {} truncated: expected {} bytes, got {}",
                commit_ts, expected, actual
            ),
            CodecError::BadMagic { commit_ts } => write!(f, "entry {} has bad magic", commit_ts),
            CodecError::UnsupportedVersion { commit_ts, version } => {
                write!(f, "entry {} has unsupported version {}", commit_ts, version)
            }
            CodecError::ChecksumMismatch {
                commit_ts,
                expected,
                actual,
            } => write!(
                f,
                "entry {} checksum mismatch: expected {:08x}, got {:08x}",
                commit_ts, expected, actual
            ),
            CodecError::Serialization { commit_ts, message } => {
                write!(f, "entry {} serialization error: {}", commit_ts, message)
            }
            CodecError::KeyMismatch { key_ts, record_ts } => write!(
                f,
                "entry stored under {} carries commit ts {}",
                key_ts, record_ts
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode a commit timestamp as an order-preserving key
pub fn encode_commit_ts(ts: i64) -> [u8; KEY_SIZE] {
    ((ts as u64) ^ SIGN_MASK).to_be_bytes()
}

/// Decode an order-preserving key back into a commit timestamp
pub fn decode_commit_ts(key: &[u8]) -> Result<i64, CodecError> {
    let bytes: [u8; KEY_SIZE] = key
        .try_into()
        .map_err(|_| CodecError::InvalidKey(key.to_vec()))?;
    Ok((u64::from_be_bytes(bytes) ^ SIGN_MASK) as i64)
}

/// Serialize an entry into a framed, checksummed record
pub fn encode_entry(entry: &Entry) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(entry).map_err(|e| CodecError::Serialization {
        commit_ts: entry.commit_ts,
        message: e.to_string(),
    })?;
    let checksum = crc32fast::hash(&body);

    let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len());
    buf.extend_from_slice(&ENTRY_MAGIC);
    buf.push(ENTRY_VERSION);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf.extend_from_slice(&body);

    debug_assert_eq!(buf.len(), ENTRY_HEADER_SIZE + body.len());
    Ok(buf)
}

/// Decode a framed record stored under `key_ts`.
///
/// Every failure mode names the commit timestamp the record was read under.
pub fn decode_entry(key_ts: i64, data: &[u8]) -> Result<Entry, CodecError> {
    if data.len() < ENTRY_HEADER_SIZE {
        return Err(CodecError::Truncated {
            commit_ts: key_ts,
            expected: ENTRY_HEADER_SIZE,
            actual: data.len(),
        });
    }
    if data[0..4] != ENTRY_MAGIC {
        return Err(CodecError::BadMagic { commit_ts: key_ts });
    }
    if data[4] != ENTRY_VERSION {
        return Err(CodecError::UnsupportedVersion {
            commit_ts: key_ts,
            version: data[4],
        });
    }

    let body_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let checksum = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
    let total = ENTRY_HEADER_SIZE + body_len;
    if data.len() < total {
        return Err(CodecError::Truncated {
            commit_ts: key_ts,
            expected: total,
            actual: data.len(),
        });
    }

    let body = &data[ENTRY_HEADER_SIZE..total];
    let actual = crc32fast::hash(body);
    if actual != checksum {
        return Err(CodecError::ChecksumMismatch {
            commit_ts: key_ts,
            expected: checksum,
            actual,
        });
    }

    let entry: Entry = bincode::deserialize(body).map_err(|e| CodecError::Serialization {
        commit_ts: key_ts,
        message: e.to_string(),
    })?;
    if entry.commit_ts != key_ts {
        return Err(CodecError::KeyMismatch {
            key_ts,
            record_ts: entry.commit_ts,
        });
    }
    Ok(entry)
}
