//! Range Query - Pull Access to Complete Entries
//!
//! Returns up to `limit` payloads with `begin < commit_ts < lower`, in
//! commit order. `begin` is exclusive so a caller can page by passing back
//! the `end_commit_ts` of the previous response.

use crate::codec::{decode_commit_ts, decode_entry, encode_commit_ts, CodecError};
use crate::store::{Scan, Store, StoreError, DEFAULT_SCAN_PAGE_SIZE};
use crate::window::Window;
use bytes::Bytes;

/// Why a range query stopped early
#[derive(Debug)]
pub enum RangeQueryError {
    /// Store scan failed after `after_commit_ts`
    Store {
        after_commit_ts: i64,
        source: StoreError,
    },
    /// A stored key or entry could not be decoded
    Decode(CodecError),
}

impl std::fmt::Display for RangeQueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeQueryError::Store {
                after_commit_ts,
                source,
            } => write!(f, "scan after commit ts {} failed: {}", after_commit_ts, source),
            RangeQueryError::Decode(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RangeQueryError {}

impl From<CodecError> for RangeQueryError {
    fn from(e: CodecError) -> Self {
        RangeQueryError::Decode(e)
    }
}

/// Result of a range query: whatever was collected, plus the reason the
/// scan stopped early if it did.
#[derive(Debug)]
pub struct RangeQueryResult {
    pub payloads: Vec<Bytes>,
    /// Commit timestamp of the last payload, or `begin` when none
    pub end_commit_ts: i64,
    pub error: Option<RangeQueryError>,
}

/// Wire shape of a range query response
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeQueryResponse {
    pub payloads: Vec<Bytes>,
    pub end_commit_ts: i64,
    /// Empty on success
    pub errmsg: String,
}

impl RangeQueryResult {
    fn empty(begin: i64) -> Self {
        RangeQueryResult {
            payloads: Vec::new(),
            end_commit_ts: begin,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_response(self) -> RangeQueryResponse {
        RangeQueryResponse {
            payloads: self.payloads,
            end_commit_ts: self.end_commit_ts,
            errmsg: self.error.map(|e| e.to_string()).unwrap_or_default(),
        }
    }
}

/// Read complete entries after `begin_commit_ts` from `namespace`.
pub fn range_query<S: Store>(
    store: &S,
    window: &Window<S>,
    namespace: &str,
    begin_commit_ts: i64,
    limit: i32,
) -> RangeQueryResult {
    range_query_paged(
        store,
        window,
        namespace,
        begin_commit_ts,
        limit,
        DEFAULT_SCAN_PAGE_SIZE,
    )
}

/// `range_query` with an explicit scan page size
pub fn range_query_paged<S: Store>(
    store: &S,
    window: &Window<S>,
    namespace: &str,
    begin_commit_ts: i64,
    limit: i32,
    page_size: usize,
) -> RangeQueryResult {
    let mut result = RangeQueryResult::empty(begin_commit_ts);
    if limit <= 0 {
        return result;
    }
    let mut remaining = limit as usize;
    let safe_end = window.load_lower();
    if begin_commit_ts.checked_add(1).map_or(true, |first| first >= safe_end) {
        return result;
    }

    let start = encode_commit_ts(begin_commit_ts);
    // Small limits need no more than one page
    let page_size = page_size.min(remaining + 1).max(1);
    for item in Scan::new(store, namespace, &start, page_size) {
        let (key, value) = match item {
            Ok(pair) => pair,
            Err(source) => {
                result.error = Some(RangeQueryError::Store {
                    after_commit_ts: result.end_commit_ts,
                    source,
                });
                break;
            }
        };
        let commit_ts = match decode_commit_ts(&key) {
            Ok(ts) => ts,
            Err(e) => {
                result.error = Some(e.into());
                break;
            }
        };
        if commit_ts == begin_commit_ts {
            continue;
        }
        if commit_ts >= safe_end {
            break;
        }
        match decode_entry(commit_ts, &value) {
            Ok(entry) => {
                result.payloads.push(entry.payload);
                result.end_commit_ts = commit_ts;
            }
            Err(e) => {
                result.error = Some(e.into());
                break;
            }
        }
        remaining -= 1;
        if remaining == 0 {
            break;
        }
    }
    result
}
