//! Deposit Window
//!
//! Tracks the global safe boundary (`lower`) and the highest seen commit
//! timestamp (`upper`). Entries with `commit_ts < lower` are complete: every
//! producer has delivered past them, so any consumer may read them.
//!
//! ## Invariants
//!
//! - `lower <= upper`
//! - `lower` and `upper` never regress; persisting a smaller value is a no-op
//! - bounds are written to the store before they become visible in memory,
//!   so a reader never sees a boundary that would not survive a crash
//!
//! Callers must make the entry writes for a commit timestamp durable before
//! asking the window to move `lower` past it.

use crate::codec::{decode_commit_ts, encode_commit_ts, CodecError, ProducerId};
use crate::store::{Store, StoreError, WriteBatch};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

const LOWER_KEY: &[u8] = b"lower";
const UPPER_KEY: &[u8] = b"upper";

/// Snapshot of the window bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowBounds {
    pub lower: i64,
    pub upper: i64,
}

/// Error type for window operations
#[derive(Debug)]
pub enum WindowError {
    /// Persisting or loading the bounds failed
    Store(StoreError),
    /// A persisted bound could not be decoded
    Codec(CodecError),
}

impl std::fmt::Display for WindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowError::Store(e) => write!(f, "window store error: {}", e),
            WindowError::Codec(e) => write!(f, "window decode error: {}", e),
        }
    }
}

impl std::error::Error for WindowError {}

impl From<StoreError> for WindowError {
    fn from(e: StoreError) -> Self {
        WindowError::Store(e)
    }
}

impl From<CodecError> for WindowError {
    fn from(e: CodecError) -> Self {
        WindowError::Codec(e)
    }
}

/// Persistent window over the merged entry stream
pub struct Window<S: Store> {
    store: Arc<S>,
    namespace: String,
    bounds: RwLock<WindowBounds>,
    /// Serializes persisters so compute-then-write is atomic
    persist_lock: Mutex<()>,
    lower_tx: watch::Sender<i64>,
}

impl<S: Store> Window<S> {
    /// Load the window from the store. Missing bounds start at zero.
    pub fn open(store: Arc<S>, namespace: &str) -> Result<Self, WindowError> {
        let lower = load_bound(store.as_ref(), namespace, LOWER_KEY)?.unwrap_or(0);
        let upper = load_bound(store.as_ref(), namespace, UPPER_KEY)?
            .unwrap_or(lower)
            .max(lower);
        let (lower_tx, _) = watch::channel(lower);

        debug!("Window opened: lower={} upper={}", lower, upper);
        Ok(Window {
            store,
            namespace: namespace.to_string(),
            bounds: RwLock::new(WindowBounds { lower, upper }),
            persist_lock: Mutex::new(()),
            lower_tx,
        })
    }

    pub fn load_lower(&self) -> i64 {
        self.bounds.read().lower
    }

    pub fn load_upper(&self) -> i64 {
        self.bounds.read().upper
    }

    pub fn bounds(&self) -> WindowBounds {
        *self.bounds.read()
    }

    /// Persist a new lower bound. Raises upper too if needed.
    pub fn persist_lower(&self, ts: i64) -> Result<WindowBounds, WindowError> {
        self.advance(ts, i64::MIN)
    }

    /// Persist a new upper bound.
    pub fn persist_upper(&self, ts: i64) -> Result<WindowBounds, WindowError> {
        self.advance(i64::MIN, ts)
    }

    /// Move both bounds forward in one atomic store write.
    ///
    /// Values behind the current bounds are ignored. Returns the bounds in
    /// effect afterwards. On error nothing changes, in the store or in memory.
    pub fn advance(&self, lower: i64, upper: i64) -> Result<WindowBounds, WindowError> {
        let _guard = self.persist_lock.lock();
        let current = *self.bounds.read();

        let new_lower = current.lower.max(lower);
        let next = WindowBounds {
            lower: new_lower,
            upper: current.upper.max(upper).max(new_lower),
        };
        if next == current {
            return Ok(current);
        }

        let mut batch = WriteBatch::new();
        if next.lower != current.lower {
            batch.put(&self.namespace, LOWER_KEY, &encode_commit_ts(next.lower));
        }
        if next.upper != current.upper {
            batch.put(&self.namespace, UPPER_KEY, &encode_commit_ts(next.upper));
        }
        self.store.write_batch(batch)?;

        *self.bounds.write() = next;
        if next.lower != current.lower {
            self.lower_tx.send_replace(next.lower);
        }
        debug!(
            "Window advanced: lower {} -> {}, upper {} -> {}",
            current.lower, next.lower, current.upper, next.upper
        );
        Ok(next)
    }

    /// Receiver that observes every change of `lower`
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.lower_tx.subscribe()
    }
}

fn load_bound<S: Store>(
    store: &S,
    namespace: &str,
    key: &[u8],
) -> Result<Option<i64>, WindowError> {
    match store.get(namespace, key)? {
        Some(raw) => Ok(Some(decode_commit_ts(&raw)?)),
        None => Ok(None),
    }
}

/// Per-producer watermark table.
///
/// A producer stays in the table until it is explicitly excluded, even after
/// its stream ends: a stalled producer holds back `lower` so that nothing it
/// may still send is ever treated as complete.
#[derive(Debug, Clone, Default)]
pub struct WatermarkSet {
    marks: BTreeMap<ProducerId, i64>,
}

impl WatermarkSet {
    pub fn new() -> Self {
        WatermarkSet {
            marks: BTreeMap::new(),
        }
    }

    /// Add a producer starting at `initial`. A known producer keeps the
    /// higher of its current watermark and `initial`.
    pub fn register(&mut self, producer: ProducerId, initial: i64) {
        let mark = self.marks.entry(producer).or_insert(initial);
        *mark = (*mark).max(initial);
    }

    /// Raise a producer's watermark. Returns false if the producer is unknown.
    pub fn observe(&mut self, producer: &ProducerId, ts: i64) -> bool {
        match self.marks.get_mut(producer) {
            Some(mark) => {
                *mark = (*mark).max(ts);
                true
            }
            None => false,
        }
    }

    /// Remove a producer from the minimum (operator intervention)
    pub fn exclude(&mut self, producer: &ProducerId) -> Option<i64> {
        self.marks.remove(producer)
    }

    pub fn get(&self, producer: &ProducerId) -> Option<i64> {
        self.marks.get(producer).copied()
    }

    /// (min, max) over all watermarks, or None with no producers
    pub fn bounds(&self) -> Option<(i64, i64)> {
        let min = self.marks.values().min()?;
        let max = self.marks.values().max()?;
        Some((*min, *max))
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, SimulatedStore, SimulatedStoreConfig};

    const NS: &str = "meta_1";

    fn window() -> (Arc<InMemoryStore>, Window<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new(&[NS]));
        let window = Window::open(store.clone(), NS).unwrap();
        (store, window)
    }

    #[test]
    fn test_empty_window_starts_at_zero() {
        let (_, window) = window();
        assert_eq!(window.bounds(), WindowBounds { lower: 0, upper: 0 });
    }

    #[test]
    fn test_bounds_never_regress() {
        let (_, window) = window();
        window.advance(10, 20).unwrap();
        window.persist_lower(5).unwrap();
        window.persist_upper(15).unwrap();
        assert_eq!(window.bounds(), WindowBounds { lower: 10, upper: 20 });

        window.advance(12, 18).unwrap();
        assert_eq!(window.bounds(), WindowBounds { lower: 12, upper: 20 });
    }

    #[test]
    fn test_lower_pulls_upper_along() {
        let (_, window) = window();
        window.persist_lower(30).unwrap();
        assert_eq!(window.bounds(), WindowBounds { lower: 30, upper: 30 });
    }

    #[test]
    fn test_bounds_survive_reopen() {
        let (store, window) = window();
        window.advance(7, 9).unwrap();
        drop(window);

        let reopened = Window::open(store, NS).unwrap();
        assert_eq!(reopened.load_lower(), 7);
        assert_eq!(reopened.load_upper(), 9);
    }

    #[test]
    fn test_failed_persist_changes_nothing() {
        let store = Arc::new(SimulatedStore::new(
            InMemoryStore::new(&[NS]),
            3,
            SimulatedStoreConfig::no_faults(),
        ));
        let window = Window::open(store.clone(), NS).unwrap();
        window.advance(4, 4).unwrap();

        store.fail_next_writes(1);
        assert!(matches!(window.advance(8, 8), Err(WindowError::Store(_))));
        assert_eq!(window.bounds(), WindowBounds { lower: 4, upper: 4 });

        let reopened = Window::open(store, NS).unwrap();
        assert_eq!(reopened.load_lower(), 4);
    }

    #[test]
    fn test_subscribers_see_lower_changes() {
        let (_, window) = window();
        let mut rx = window.subscribe();
        window.persist_upper(50).unwrap();
        assert!(!rx.has_changed().unwrap());

        window.persist_lower(10).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 10);
    }

    #[test]
    fn test_watermark_set_min_max() {
        let mut marks = WatermarkSet::new();
        assert_eq!(marks.bounds(), None);

        marks.register(ProducerId::new("a"), 0);
        marks.register(ProducerId::new("b"), 0);
        assert!(marks.observe(&ProducerId::new("a"), 12));
        assert!(marks.observe(&ProducerId::new("b"), 15));
        assert_eq!(marks.bounds(), Some((12, 15)));

        assert!(!marks.observe(&ProducerId::new("ghost"), 99));
    }

    #[test]
    fn test_stalled_producer_holds_lower_until_excluded() {
        let mut marks = WatermarkSet::new();
        marks.register(ProducerId::new("fast"), 0);
        marks.register(ProducerId::new("stalled"), 0);
        marks.observe(&ProducerId::new("fast"), 100);
        assert_eq!(marks.bounds(), Some((0, 100)));

        assert_eq!(marks.exclude(&ProducerId::new("stalled")), Some(0));
        assert_eq!(marks.bounds(), Some((100, 100)));
    }

    #[test]
    fn test_reregister_keeps_higher_mark() {
        let mut marks = WatermarkSet::new();
        marks.register(ProducerId::new("a"), 0);
        marks.observe(&ProducerId::new("a"), 40);
        marks.register(ProducerId::new("a"), 10);
        assert_eq!(marks.get(&ProducerId::new("a")), Some(40));
    }
}
