//! Collector - Multi-Producer Ingestion
//!
//! Each connected producer gets its own ingestion task. Producers push
//! entries (already ordered by commit timestamp) through a `ProducerHandle`
//! and wait for an acknowledgement, which is only sent once the entry is
//! durable in the store and the window reflects it.
//!
//! ## Architecture
//!
//! ```text
//! Producer A ──► ingest task A ──┐
//! Producer B ──► ingest task B ──┼──► Store (entries) ──► WatermarkSet ──► Window
//! Producer C ──► ingest task C ──┘
//! ```
//!
//! ## Ordering
//!
//! Within a session a producer's commit timestamps must strictly increase,
//! and a reconnecting producer continues after its own watermark. Anything
//! else is rejected and ends that producer's task; the producer keeps its
//! place in the watermark set, so the window stays put until it reconnects
//! or an operator excludes it.
//!
//! An entry is only written while its producer is registered, and the
//! registered producer's watermark is below it, so every write lands above
//! `lower`. Exclusion waits for in-flight writes; a session whose producer
//! was excluded fails on its next message.
//!
//! ## Membership
//!
//! Known producers are recorded under `producer/<id>` in the window
//! namespace. After a restart every recorded producer is counted again at
//! the persisted `lower`, so a producer that has not reconnected yet still
//! holds the window back.

use crate::codec::{encode_commit_ts, encode_entry, CodecError, Entry, ProducerId};
use crate::config::CollectorConfig;
use crate::store::{Namespaces, Store, StoreError};
use crate::window::{WatermarkSet, Window, WindowBounds};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PRODUCER_PREFIX: &[u8] = b"producer/";

/// Error type for ingestion.
///
/// Cloneable so the same error can be sent to the producer and returned
/// from the ingestion task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    /// Commit timestamp not strictly after the producer's last one
    OutOfOrder {
        producer: ProducerId,
        commit_ts: i64,
        last_seen: i64,
    },
    /// Entry write failed; the entry is not acknowledged
    Store {
        producer: ProducerId,
        commit_ts: i64,
        message: String,
    },
    /// Entry could not be encoded
    Codec(CodecError),
    /// Window persistence failed after the entry was written
    Window {
        producer: ProducerId,
        commit_ts: i64,
        message: String,
    },
    /// Producer already has a running ingestion task
    AlreadyConnected(ProducerId),
    /// Ingestion task is gone
    Disconnected(ProducerId),
    /// Collector is shutting down
    ShuttingDown,
    /// Ingestion task panicked or was aborted
    Aborted { producer: ProducerId, message: String },
    /// Membership bookkeeping failed
    Membership { producer: ProducerId, message: String },
    /// Producer was excluded from the window while its session was open
    Excluded(ProducerId),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::OutOfOrder {
                producer,
                commit_ts,
                last_seen,
            } => write!(
                f,
                "producer {} sent commit ts {} after {}",
                producer, commit_ts, last_seen
            ),
            CollectError::Store {
                producer,
                commit_ts,
                message,
            } => write!(
                f,
                "producer {} entry {} write failed: {}",
                producer, commit_ts, message
            ),
            CollectError::Codec(e) => write!(f, "entry encode failed: {}", e),
            CollectError::Window {
                producer,
                commit_ts,
                message,
            } => write!(
                f,
                "producer {} window update at {} failed: {}",
                producer, commit_ts, message
            ),
            CollectError::AlreadyConnected(p) => write!(f, "producer {} already connected", p),
            CollectError::Disconnected(p) => write!(f, "producer {} ingestion task is gone", p),
            CollectError::ShuttingDown => write!(f, "collector is shutting down"),
            CollectError::Aborted { producer, message } => {
                write!(f, "producer {} ingestion task aborted: {}", producer, message)
            }
            CollectError::Membership { producer, message } => {
                write!(f, "producer {} membership update failed: {}", producer, message)
            }
            CollectError::Excluded(p) => write!(f, "producer {} was excluded", p),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<CodecError> for CollectError {
    fn from(e: CodecError) -> Self {
        CollectError::Codec(e)
    }
}

/// Summary returned by a finished ingestion task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerReport {
    pub producer: ProducerId,
    /// Entries written during the session
    pub accepted: u64,
    /// Last commit timestamp accepted (entry or heartbeat)
    pub last_commit_ts: i64,
}

struct Shared<S: Store> {
    store: Arc<S>,
    window: Arc<Window<S>>,
    namespaces: Namespaces,
    /// Persisted under the lock so `lower` never runs ahead of the set
    watermarks: Mutex<WatermarkSet>,
    /// Shared by entry writes, exclusive for `exclude`
    membership: RwLock<()>,
    active: Mutex<HashSet<ProducerId>>,
}

impl<S: Store> Shared<S> {
    /// Persist (min, max) of `marks`. Caller holds the watermarks lock.
    fn advance_window(
        &self,
        marks: &WatermarkSet,
    ) -> Result<WindowBounds, crate::window::WindowError> {
        match marks.bounds() {
            Some((lower, upper)) => self.window.advance(lower, upper),
            None => Ok(self.window.bounds()),
        }
    }

    fn membership_key(producer: &ProducerId) -> Vec<u8> {
        let mut key = PRODUCER_PREFIX.to_vec();
        key.extend_from_slice(producer.as_str().as_bytes());
        key
    }
}

/// Synchronous ingestion core for one producer session.
///
/// The async task wraps this; the simulation harness drives it directly.
pub struct IngestSession<S: Store> {
    shared: Arc<Shared<S>>,
    producer: ProducerId,
    last_seen: i64,
    accepted: u64,
}

impl<S: Store> IngestSession<S> {
    pub fn producer(&self) -> &ProducerId {
        &self.producer
    }

    /// Last commit timestamp accepted in this session (starts at the resume point)
    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Validate, persist, and window one entry.
    pub fn ingest(&mut self, commit_ts: i64, payload: Bytes) -> Result<WindowBounds, CollectError> {
        let shared = self.shared.clone();
        let _member = shared.membership.read();
        self.check_member()?;
        self.check_order(commit_ts)?;

        let entry = Entry::new(commit_ts, self.producer.clone(), payload);
        let record = encode_entry(&entry)?;
        self.shared
            .store
            .put(
                &self.shared.namespaces.entries,
                &encode_commit_ts(commit_ts),
                &record,
            )
            .map_err(|e| CollectError::Store {
                producer: self.producer.clone(),
                commit_ts,
                message: e.to_string(),
            })?;

        self.accepted += 1;
        self.mark(commit_ts)
    }

    /// Advance the producer's watermark without writing an entry.
    pub fn heartbeat(&mut self, commit_ts: i64) -> Result<WindowBounds, CollectError> {
        self.check_member()?;
        self.check_order(commit_ts)?;
        self.mark(commit_ts)
    }

    fn check_member(&self) -> Result<(), CollectError> {
        if self.shared.watermarks.lock().get(&self.producer).is_none() {
            return Err(CollectError::Excluded(self.producer.clone()));
        }
        Ok(())
    }

    fn check_order(&self, commit_ts: i64) -> Result<(), CollectError> {
        if commit_ts <= self.last_seen {
            return Err(CollectError::OutOfOrder {
                producer: self.producer.clone(),
                commit_ts,
                last_seen: self.last_seen,
            });
        }
        Ok(())
    }

    fn mark(&mut self, commit_ts: i64) -> Result<WindowBounds, CollectError> {
        let mut marks = self.shared.watermarks.lock();
        if !marks.observe(&self.producer, commit_ts) {
            return Err(CollectError::Excluded(self.producer.clone()));
        }
        self.last_seen = commit_ts;

        self.shared
            .advance_window(&marks)
            .map_err(|e| CollectError::Window {
                producer: self.producer.clone(),
                commit_ts,
                message: e.to_string(),
            })
    }

    fn report(&self) -> ProducerReport {
        ProducerReport {
            producer: self.producer.clone(),
            accepted: self.accepted,
            last_commit_ts: self.last_seen,
        }
    }
}

impl<S: Store> Drop for IngestSession<S> {
    fn drop(&mut self) {
        self.shared.active.lock().remove(&self.producer);
    }
}

/// Messages for an ingestion task
enum IngestMessage {
    Entry {
        commit_ts: i64,
        payload: Bytes,
        ack_tx: oneshot::Sender<Result<(), CollectError>>,
    },
    Heartbeat {
        commit_ts: i64,
        ack_tx: oneshot::Sender<Result<(), CollectError>>,
    },
}

/// Handle a producer uses to push its stream into the collector
pub struct ProducerHandle {
    producer: ProducerId,
    resume_from: i64,
    tx: mpsc::Sender<IngestMessage>,
}

impl ProducerHandle {
    pub fn producer(&self) -> &ProducerId {
        &self.producer
    }

    /// Where the stream must continue (exclusive): the window lower at
    /// connect time, or the producer's own watermark if that is higher.
    pub fn resume_from(&self) -> i64 {
        self.resume_from
    }

    /// Deliver one entry and wait until it is durable and windowed.
    pub async fn deliver(&self, commit_ts: i64, payload: impl Into<Bytes>) -> Result<(), CollectError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(IngestMessage::Entry {
            commit_ts,
            payload: payload.into(),
            ack_tx,
        })
        .await?;
        self.wait(ack_rx).await
    }

    /// Report progress without an entry.
    pub async fn heartbeat(&self, commit_ts: i64) -> Result<(), CollectError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(IngestMessage::Heartbeat { commit_ts, ack_tx })
            .await?;
        self.wait(ack_rx).await
    }

    /// End the stream. The producer stays counted in the window.
    pub fn disconnect(self) {}

    async fn send(&self, msg: IngestMessage) -> Result<(), CollectError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| CollectError::Disconnected(self.producer.clone()))
    }

    async fn wait(
        &self,
        ack_rx: oneshot::Receiver<Result<(), CollectError>>,
    ) -> Result<(), CollectError> {
        ack_rx
            .await
            .unwrap_or_else(|_| Err(CollectError::Disconnected(self.producer.clone())))
    }
}

/// Merges producer streams into the store and advances the window
pub struct Collector<S: Store> {
    shared: Arc<Shared<S>>,
    config: CollectorConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(ProducerId, JoinHandle<Result<ProducerReport, CollectError>>)>>,
}

impl<S: Store> Collector<S> {
    /// Create a collector, restoring known producers from the store.
    pub fn open(
        store: Arc<S>,
        window: Arc<Window<S>>,
        namespaces: Namespaces,
        config: CollectorConfig,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let lower = window.load_lower();
        let mut watermarks = WatermarkSet::new();
        for pair in store.scan(&namespaces.window, PRODUCER_PREFIX) {
            let (key, _) = pair?;
            let Some(id) = key.strip_prefix(PRODUCER_PREFIX) else {
                break;
            };
            let producer = ProducerId::new(String::from_utf8_lossy(id));
            debug!("Restored producer {} at {}", producer, lower);
            watermarks.register(producer, lower);
        }
        if !watermarks.is_empty() {
            info!(
                "Collector restored {} producers at lower={}",
                watermarks.len(),
                lower
            );
        }

        Ok(Collector {
            shared: Arc::new(Shared {
                store,
                window,
                namespaces,
                watermarks: Mutex::new(watermarks),
                membership: RwLock::new(()),
                active: Mutex::new(HashSet::new()),
            }),
            config,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start a session for `producer` without spawning a task.
    pub fn session(&self, producer: ProducerId) -> Result<IngestSession<S>, CollectError> {
        if self.cancel.is_cancelled() {
            return Err(CollectError::ShuttingDown);
        }
        if !self.shared.active.lock().insert(producer.clone()) {
            return Err(CollectError::AlreadyConnected(producer));
        }

        // From here on the session's Drop releases the active slot
        let mut session = IngestSession {
            shared: self.shared.clone(),
            producer: producer.clone(),
            last_seen: 0,
            accepted: 0,
        };

        let mut marks = self.shared.watermarks.lock();
        let lower = self.shared.window.load_lower();
        let resume_from = match marks.get(&producer) {
            Some(mark) => mark.max(lower),
            None => {
                // lower trails the minimum after a failed window persist
                let start = marks.bounds().map_or(lower, |(min, _)| min.max(lower));
                self.shared
                    .store
                    .put(
                        &self.shared.namespaces.window,
                        &Shared::<S>::membership_key(&producer),
                        &encode_commit_ts(start),
                    )
                    .map_err(|e| CollectError::Membership {
                        producer: producer.clone(),
                        message: e.to_string(),
                    })?;
                marks.register(producer.clone(), start);
                start
            }
        };
        drop(marks);

        session.last_seen = resume_from;
        Ok(session)
    }

    /// Connect a producer and spawn its ingestion task.
    pub fn connect(&self, producer: ProducerId) -> Result<ProducerHandle, CollectError> {
        let session = self.session(producer.clone())?;
        let resume_from = session.last_seen();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        info!("Producer {} connected, resuming after {}", producer, resume_from);
        let task = tokio::spawn(run_ingest(session, rx, self.cancel.clone()));
        self.tasks.lock().push((producer.clone(), task));

        Ok(ProducerHandle {
            producer,
            resume_from,
            tx,
        })
    }

    /// Drop a producer from the window minimum (operator intervention).
    ///
    /// Returns the window bounds after recomputation.
    pub fn exclude(&self, producer: &ProducerId) -> Result<WindowBounds, CollectError> {
        let _writers = self.shared.membership.write();
        let mut marks = self.shared.watermarks.lock();
        self.shared
            .store
            .delete(
                &self.shared.namespaces.window,
                &Shared::<S>::membership_key(producer),
            )
            .map_err(|e| CollectError::Membership {
                producer: producer.clone(),
                message: e.to_string(),
            })?;
        let removed = marks.exclude(producer);
        warn!(
            "Producer {} excluded from window (watermark {:?})",
            producer, removed
        );

        self.shared
            .advance_window(&marks)
            .map_err(|e| CollectError::Window {
                producer: producer.clone(),
                commit_ts: removed.unwrap_or_default(),
                message: e.to_string(),
            })
    }

    /// Current watermark of every known producer
    pub fn watermarks(&self) -> WatermarkSet {
        self.shared.watermarks.lock().clone()
    }

    pub fn window(&self) -> &Arc<Window<S>> {
        &self.shared.window
    }

    /// Await every ingestion task spawned so far.
    pub async fn join(&self) -> Vec<Result<ProducerReport, CollectError>> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let (producers, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let outcomes = futures::future::join_all(handles).await;

        producers
            .into_iter()
            .zip(outcomes)
            .map(|(producer, outcome)| match outcome {
                Ok(result) => result,
                Err(e) => Err(CollectError::Aborted {
                    producer,
                    message: e.to_string(),
                }),
            })
            .collect()
    }
}

/// Ingestion task body. Cancellation is only observed between messages,
/// so an in-flight write always completes and is acknowledged.
async fn run_ingest<S: Store>(
    mut session: IngestSession<S>,
    mut rx: mpsc::Receiver<IngestMessage>,
    cancel: CancellationToken,
) -> Result<ProducerReport, CollectError> {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Producer {} ingestion cancelled", session.producer());
                break;
            }
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else {
            info!("Producer {} disconnected", session.producer());
            break;
        };

        let (result, ack_tx) = match msg {
            IngestMessage::Entry {
                commit_ts,
                payload,
                ack_tx,
            } => (session.ingest(commit_ts, payload), ack_tx),
            IngestMessage::Heartbeat { commit_ts, ack_tx } => {
                (session.heartbeat(commit_ts), ack_tx)
            }
        };

        match result {
            Ok(_) => {
                let _ = ack_tx.send(Ok(()));
            }
            Err(e) => {
                error!("Producer {} ingestion terminated: {}", session.producer(), e);
                let _ = ack_tx.send(Err(e.clone()));
                return Err(e);
            }
        }
    }
    Ok(session.report())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_entry;
    use crate::store::{InMemoryStore, SimulatedStore, SimulatedStoreConfig};

    fn setup<S: Store>(store: S) -> (Arc<S>, Collector<S>, CancellationToken) {
        let ns = Namespaces::for_cluster(1);
        let store = Arc::new(store);
        let window = Arc::new(Window::open(store.clone(), &ns.window).unwrap());
        let cancel = CancellationToken::new();
        let collector = Collector::open(
            store.clone(),
            window,
            ns,
            CollectorConfig::default(),
            cancel.clone(),
        )
        .unwrap();
        (store, collector, cancel)
    }

    fn memory() -> InMemoryStore {
        let ns = Namespaces::for_cluster(1);
        InMemoryStore::new(&ns.all())
    }

    #[test]
    fn test_window_is_min_and_max_of_producers() {
        let (_, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        let mut b = collector.session(ProducerId::new("b")).unwrap();

        a.ingest(10, Bytes::from_static(b"a10")).unwrap();
        let bounds = b.ingest(13, Bytes::from_static(b"b13")).unwrap();
        assert_eq!(bounds, WindowBounds { lower: 10, upper: 13 });

        let bounds = a.ingest(20, Bytes::from_static(b"a20")).unwrap();
        assert_eq!(bounds, WindowBounds { lower: 13, upper: 20 });
    }

    #[test]
    fn test_entries_are_persisted_with_producer() {
        let (store, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        a.ingest(5, Bytes::from_static(b"payload")).unwrap();

        let ns = Namespaces::for_cluster(1);
        let raw = store.get(&ns.entries, &encode_commit_ts(5)).unwrap().unwrap();
        let entry = decode_entry(5, &raw).unwrap();
        assert_eq!(entry.producer_id, ProducerId::new("a"));
        assert_eq!(&entry.payload[..], b"payload");
    }

    #[test]
    fn test_out_of_order_is_rejected() {
        let (_, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        a.ingest(10, Bytes::new()).unwrap();

        let err = a.ingest(10, Bytes::new()).unwrap_err();
        assert_eq!(
            err,
            CollectError::OutOfOrder {
                producer: ProducerId::new("a"),
                commit_ts: 10,
                last_seen: 10
            }
        );
        assert!(a.ingest(9, Bytes::new()).is_err());
    }

    #[test]
    fn test_heartbeat_advances_without_entry() {
        let (store, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        let mut b = collector.session(ProducerId::new("b")).unwrap();
        a.ingest(10, Bytes::new()).unwrap();
        let bounds = b.heartbeat(30).unwrap();
        assert_eq!(bounds, WindowBounds { lower: 10, upper: 30 });

        let ns = Namespaces::for_cluster(1);
        assert_eq!(store.len(&ns.entries), 1);
    }

    #[test]
    fn test_store_failure_does_not_advance_window() {
        let store = SimulatedStore::new(memory(), 1, SimulatedStoreConfig::no_faults());
        let (store, collector, _) = setup(store);
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        a.ingest(4, Bytes::new()).unwrap();

        store.fail_next_writes(1);
        let err = a.ingest(8, Bytes::new()).unwrap_err();
        assert!(matches!(err, CollectError::Store { commit_ts: 8, .. }));
        assert_eq!(collector.window().load_lower(), 4);
        assert_eq!(collector.watermarks().get(&ProducerId::new("a")), Some(4));
        assert_eq!(a.last_seen(), 4);
    }

    #[test]
    fn test_duplicate_session_rejected_until_dropped() {
        let (_, collector, _) = setup(memory());
        let a = collector.session(ProducerId::new("a")).unwrap();
        assert_eq!(
            collector.session(ProducerId::new("a")).err(),
            Some(CollectError::AlreadyConnected(ProducerId::new("a")))
        );
        drop(a);
        assert!(collector.session(ProducerId::new("a")).is_ok());
    }

    #[test]
    fn test_reconnect_resumes_after_own_watermark() {
        let (store, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        let mut b = collector.session(ProducerId::new("b")).unwrap();
        a.ingest(42, Bytes::new()).unwrap();
        b.ingest(30, Bytes::new()).unwrap();
        drop(a);

        let mut a = collector.session(ProducerId::new("a")).unwrap();
        assert_eq!(a.last_seen(), 42);

        // Lower catches up with a's watermark; a cannot write beneath it
        let bounds = b.ingest(50, Bytes::new()).unwrap();
        assert_eq!(bounds.lower, 42);
        let err = a.ingest(35, Bytes::from_static(b"late")).unwrap_err();
        assert!(matches!(err, CollectError::OutOfOrder { commit_ts: 35, last_seen: 42, .. }));

        let ns = Namespaces::for_cluster(1);
        assert!(store.get(&ns.entries, &encode_commit_ts(35)).unwrap().is_none());
        a.ingest(43, Bytes::new()).unwrap();
    }

    #[tokio::test]
    async fn test_handle_resume_point_is_own_watermark() {
        let (_, collector, _) = setup(memory());
        let a = collector.connect(ProducerId::new("a")).unwrap();
        let b = collector.connect(ProducerId::new("b")).unwrap();
        a.deliver(20, &b"a20"[..]).await.unwrap();
        b.deliver(7, &b"b7"[..]).await.unwrap();
        a.disconnect();

        // The old task releases its slot once it sees the channel close
        let a = loop {
            match collector.connect(ProducerId::new("a")) {
                Err(CollectError::AlreadyConnected(_)) => tokio::task::yield_now().await,
                other => break other.unwrap(),
            }
        };
        assert_eq!(collector.window().load_lower(), 7);
        assert_eq!(a.resume_from(), 20);
    }

    #[test]
    fn test_new_producer_starts_at_current_minimum() {
        let (_, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        a.ingest(10, Bytes::new()).unwrap();
        assert_eq!(collector.window().load_lower(), 10);

        let mut late = collector.session(ProducerId::new("late")).unwrap();
        assert_eq!(late.last_seen(), 10);
        assert!(late.ingest(5, Bytes::new()).is_err());
        assert_eq!(late.ingest(11, Bytes::new()).unwrap().lower, 10);
    }

    #[test]
    fn test_restart_restores_membership() {
        let (store, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        let mut b = collector.session(ProducerId::new("b")).unwrap();
        a.ingest(10, Bytes::new()).unwrap();
        b.ingest(20, Bytes::new()).unwrap();
        drop((a, b, collector));

        // Only "a" comes back; "b" must still hold the window
        let ns = Namespaces::for_cluster(1);
        let window = Arc::new(Window::open(store.clone(), &ns.window).unwrap());
        let collector = Collector::open(
            store,
            window,
            ns,
            CollectorConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(collector.watermarks().len(), 2);

        let mut a = collector.session(ProducerId::new("a")).unwrap();
        assert_eq!(a.last_seen(), 10);
        let bounds = a.ingest(50, Bytes::new()).unwrap();
        assert_eq!(bounds.lower, 10);
    }

    #[test]
    fn test_exclude_unblocks_window() {
        let (_, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        let _stalled = collector.session(ProducerId::new("stalled")).unwrap();
        a.ingest(100, Bytes::new()).unwrap();
        assert_eq!(collector.window().load_lower(), 0);

        let bounds = collector.exclude(&ProducerId::new("stalled")).unwrap();
        assert_eq!(bounds.lower, 100);
    }

    #[test]
    fn test_excluded_session_cannot_write() {
        let (store, collector, _) = setup(memory());
        let mut a = collector.session(ProducerId::new("a")).unwrap();
        let mut stalled = collector.session(ProducerId::new("stalled")).unwrap();
        a.ingest(100, Bytes::new()).unwrap();
        assert_eq!(collector.exclude(&ProducerId::new("stalled")).unwrap().lower, 100);

        let err = stalled.ingest(5, Bytes::from_static(b"late5")).unwrap_err();
        assert_eq!(err, CollectError::Excluded(ProducerId::new("stalled")));
        assert_eq!(
            stalled.heartbeat(200).unwrap_err(),
            CollectError::Excluded(ProducerId::new("stalled"))
        );

        let ns = Namespaces::for_cluster(1);
        assert!(store.get(&ns.entries, &encode_commit_ts(5)).unwrap().is_none());
        assert_eq!(collector.window().load_lower(), 100);
        assert_eq!(collector.watermarks().get(&ProducerId::new("stalled")), None);
    }

    #[tokio::test]
    async fn test_exclude_terminates_running_task() {
        let (store, collector, _) = setup(memory());
        let a = collector.connect(ProducerId::new("a")).unwrap();
        let stalled = collector.connect(ProducerId::new("stalled")).unwrap();
        a.deliver(100, &b"a100"[..]).await.unwrap();
        collector.exclude(&ProducerId::new("stalled")).unwrap();

        let err = stalled.deliver(5, &b"late5"[..]).await.unwrap_err();
        assert_eq!(err, CollectError::Excluded(ProducerId::new("stalled")));
        let err = stalled.deliver(6, &b"late6"[..]).await.unwrap_err();
        assert_eq!(err, CollectError::Disconnected(ProducerId::new("stalled")));

        let ns = Namespaces::for_cluster(1);
        assert_eq!(store.len(&ns.entries), 1);
        a.disconnect();
        let results = collector.join().await;
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(CollectError::Excluded(_)))));
    }

    #[tokio::test]
    async fn test_connected_producer_round_trip() {
        let (store, collector, cancel) = setup(memory());
        let handle = collector.connect(ProducerId::new("a")).unwrap();
        assert_eq!(handle.resume_from(), 0);

        for ts in 1..=5 {
            handle.deliver(ts, format!("e{}", ts).into_bytes()).await.unwrap();
        }
        handle.disconnect();

        let results = collector.join().await;
        assert_eq!(results.len(), 1);
        let report = results[0].as_ref().unwrap();
        assert_eq!(report.accepted, 5);
        assert_eq!(report.last_commit_ts, 5);
        assert_eq!(store.len(&Namespaces::for_cluster(1).entries), 5);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_out_of_order_terminates_task() {
        let (_, collector, _) = setup(memory());
        let handle = collector.connect(ProducerId::new("a")).unwrap();
        handle.deliver(3, &b"x"[..]).await.unwrap();

        let err = handle.deliver(2, &b"y"[..]).await.unwrap_err();
        assert!(matches!(err, CollectError::OutOfOrder { commit_ts: 2, .. }));

        // Task is gone; further deliveries fail
        let err = handle.deliver(4, &b"z"[..]).await.unwrap_err();
        assert_eq!(err, CollectError::Disconnected(ProducerId::new("a")));

        let results = collector.join().await;
        assert!(matches!(results[0], Err(CollectError::OutOfOrder { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_tasks() {
        let (_, collector, cancel) = setup(memory());
        let handle = collector.connect(ProducerId::new("a")).unwrap();
        handle.deliver(1, &b"x"[..]).await.unwrap();

        cancel.cancel();
        let results = collector.join().await;
        assert_eq!(results[0].as_ref().unwrap().accepted, 1);
        assert_eq!(
            collector.connect(ProducerId::new("b")).err(),
            Some(CollectError::ShuttingDown)
        );
    }
}
