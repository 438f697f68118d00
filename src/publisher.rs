//! Publisher - Ordered Export to a Downstream Sink
//!
//! Scans the merged entry stream after the save point, stopping before the
//! window's `lower`, and delivers each entry to the sink in commit order.
//!
//! ## Delivery guarantees
//!
//! - Entries at or above `lower` are never delivered (they may still be
//!   incomplete).
//! - The save point only moves past an entry after the sink confirmed it;
//!   a failed delivery is retried, never skipped.
//! - With `savepoint_batch = 1` at most the last unconfirmed entry is
//!   redelivered after a restart.
//!
//! ## Loop
//!
//! ```text
//! loop {
//!     pass: scan (save_point, lower) -> deliver -> persist save point
//!     if the pass delivered nothing: wait for lower to move or poll_interval
//! }
//! ```

use crate::codec::{decode_commit_ts, decode_entry, encode_commit_ts, CodecError, Entry};
use crate::config::{PublisherConfig, RetryPolicy};
use crate::savepoint::{SavePoint, SavePointError};
use crate::sink::Sink;
use crate::store::{Namespaces, Scan, Store, StoreError};
use crate::window::Window;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for the publisher
#[derive(Debug)]
pub enum PublishError {
    /// Scanning the entry namespace failed
    Store(StoreError),
    /// Loading or persisting the save point failed
    SavePoint(SavePointError),
    /// A stored entry could not be decoded; it can never be skipped
    Decode(CodecError),
    /// Delivery retries ran out
    Exhausted {
        commit_ts: i64,
        attempts: u32,
        last_error: String,
    },
    /// Publisher task panicked or was aborted
    Aborted(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Store(e) => write!(f, "publisher scan failed: {}", e),
            PublishError::SavePoint(e) => write!(f, "publisher save point failed: {}", e),
            PublishError::Decode(e) => write!(f, "publisher cannot decode entry: {}", e),
            PublishError::Exhausted {
                commit_ts,
                attempts,
                last_error,
            } => write!(
                f,
                "delivery of commit ts {} failed after {} attempts: {}",
                commit_ts, attempts, last_error
            ),
            PublishError::Aborted(msg) => write!(f, "publisher task aborted: {}", msg),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<StoreError> for PublishError {
    fn from(e: StoreError) -> Self {
        PublishError::Store(e)
    }
}

impl From<SavePointError> for PublishError {
    fn from(e: SavePointError) -> Self {
        PublishError::SavePoint(e)
    }
}

impl From<CodecError> for PublishError {
    fn from(e: CodecError) -> Self {
        PublishError::Decode(e)
    }
}

/// Counters reported when the publisher stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherReport {
    /// Entries confirmed by the sink
    pub delivered: u64,
    /// Failed delivery attempts that were retried
    pub retries: u64,
    /// Completed scan passes
    pub passes: u64,
    /// Save point when the publisher stopped
    pub save_point: i64,
}

enum Delivery {
    Delivered,
    Cancelled,
}

/// Exports complete entries to a sink
pub struct Publisher<S: Store, K: Sink> {
    store: Arc<S>,
    window: Arc<Window<S>>,
    entries_ns: String,
    save_point: SavePoint<S>,
    sink: K,
    config: PublisherConfig,
    scan_page_size: usize,
    report: PublisherReport,
}

impl<S: Store, K: Sink> Publisher<S, K> {
    /// Load the save point (or `initial_commit_ts`) and prepare to publish.
    pub fn open(
        store: Arc<S>,
        window: Arc<Window<S>>,
        namespaces: &Namespaces,
        sink: K,
        config: PublisherConfig,
        scan_page_size: usize,
    ) -> Result<Self, PublishError> {
        let save_point = SavePoint::open(
            store.clone(),
            &namespaces.savepoint,
            config.initial_commit_ts,
        )?;
        info!("Publisher opened at save point {}", save_point.get());

        Ok(Publisher {
            store,
            window,
            entries_ns: namespaces.entries.clone(),
            report: PublisherReport {
                save_point: save_point.get(),
                ..Default::default()
            },
            save_point,
            sink,
            config,
            scan_page_size: scan_page_size.max(1),
        })
    }

    /// Last commit timestamp confirmed downstream
    pub fn save_point(&self) -> i64 {
        self.save_point.get()
    }

    pub fn report(&self) -> &PublisherReport {
        &self.report
    }

    /// Deliver everything between the save point and the current `lower`.
    ///
    /// Returns the number of entries delivered. Stops early, with the save
    /// point persisted, when `cancel` fires.
    pub async fn publish_pass(&mut self, cancel: &CancellationToken) -> Result<u64, PublishError> {
        let safe_end = self.window.load_lower();
        let start = self.save_point.get();
        let Some(first) = start.checked_add(1) else {
            return Ok(0);
        };
        if first >= safe_end {
            return Ok(0);
        }

        let mut cursor = start;
        let mut delivered = 0u64;
        let outcome = self
            .deliver_range(first, safe_end, cancel, &mut cursor, &mut delivered)
            .await;

        // Persist whatever was confirmed, even when the pass failed
        if cursor > self.save_point.get() {
            if let Err(e) = self.save_point.persist(cursor) {
                if outcome.is_ok() {
                    return Err(e.into());
                }
                warn!("Failed to persist save point {} after error: {}", cursor, e);
            }
        }
        self.report.delivered += delivered;
        self.report.save_point = self.save_point.get();
        self.report.passes += 1;
        outcome?;

        if delivered > 0 {
            debug!(
                "Publisher pass delivered {} entries up to {} (lower {})",
                delivered, cursor, safe_end
            );
        }
        Ok(delivered)
    }

    async fn deliver_range(
        &mut self,
        first: i64,
        safe_end: i64,
        cancel: &CancellationToken,
        cursor: &mut i64,
        delivered: &mut u64,
    ) -> Result<(), PublishError> {
        let mut pending = 0usize;
        let scan = Scan::new(
            self.store.as_ref(),
            &self.entries_ns,
            &encode_commit_ts(first),
            self.scan_page_size,
        );
        for item in scan {
            if cancel.is_cancelled() {
                break;
            }
            let (key, value) = item?;
            let commit_ts = decode_commit_ts(&key)?;
            if commit_ts >= safe_end {
                break;
            }
            let entry = decode_entry(commit_ts, &value)?;

            match deliver_with_retry(
                &self.sink,
                &self.config.retry,
                &entry,
                cancel,
                &mut self.report.retries,
            )
            .await?
            {
                Delivery::Delivered => {}
                Delivery::Cancelled => break,
            }

            *cursor = commit_ts;
            *delivered += 1;
            pending += 1;
            if pending >= self.config.savepoint_batch {
                self.save_point.persist(*cursor)?;
                pending = 0;
            }
        }
        Ok(())
    }

    /// Publish until cancelled or a fatal error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PublisherReport, PublishError> {
        let mut lower_rx = self.window.subscribe();
        info!("Publisher started at save point {}", self.save_point.get());

        while !cancel.is_cancelled() {
            match self.publish_pass(&cancel).await {
                Ok(0) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = lower_rx.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Publisher stopped at save point {}: {}", self.save_point.get(), e);
                    return Err(e);
                }
            }
        }

        info!(
            "Publisher stopped at save point {} ({} delivered, {} retries)",
            self.report.save_point, self.report.delivered, self.report.retries
        );
        Ok(self.report)
    }
}

async fn deliver_with_retry<K: Sink>(
    sink: &K,
    retry: &RetryPolicy,
    entry: &Entry,
    cancel: &CancellationToken,
    retries: &mut u64,
) -> Result<Delivery, PublishError> {
    let mut failures = 0u32;
    loop {
        let last_error = match tokio::time::timeout(retry.attempt_timeout, sink.deliver(entry)).await
        {
            Ok(Ok(())) => return Ok(Delivery::Delivered),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", retry.attempt_timeout),
        };

        failures += 1;
        if !retry.allows(failures) {
            return Err(PublishError::Exhausted {
                commit_ts: entry.commit_ts,
                attempts: failures,
                last_error,
            });
        }
        *retries += 1;

        let backoff = retry.backoff(failures);
        warn!(
            "Delivery of commit ts {} failed (attempt {}): {}; retrying in {:?}",
            entry.commit_ts, failures, last_error, backoff
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Delivery::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_entry, ProducerId};
    use crate::sink::{MemorySink, SinkError};
    use crate::store::InMemoryStore;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        window: Arc<Window<InMemoryStore>>,
        ns: Namespaces,
    }

    impl Fixture {
        fn new() -> Self {
            let ns = Namespaces::for_cluster(1);
            let store = Arc::new(InMemoryStore::new(&ns.all()));
            let window = Arc::new(Window::open(store.clone(), &ns.window).unwrap());
            Fixture { store, window, ns }
        }

        fn write(&self, timestamps: impl IntoIterator<Item = i64>) {
            for ts in timestamps {
                let entry = Entry::new(ts, ProducerId::new("p"), format!("e{}", ts).into_bytes());
                self.store
                    .put(
                        &self.ns.entries,
                        &encode_commit_ts(ts),
                        &encode_entry(&entry).unwrap(),
                    )
                    .unwrap();
            }
        }

        fn publisher<K: Sink>(&self, sink: K) -> Publisher<InMemoryStore, K> {
            Publisher::open(
                self.store.clone(),
                self.window.clone(),
                &self.ns,
                sink,
                PublisherConfig::test(),
                4,
            )
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_pass_stops_before_lower() {
        let fx = Fixture::new();
        fx.write(1..=10);
        fx.window.advance(6, 10).unwrap();

        let sink = MemorySink::new();
        let mut publisher = fx.publisher(sink.clone());
        let cancel = CancellationToken::new();
        assert_eq!(publisher.publish_pass(&cancel).await.unwrap(), 5);
        assert_eq!(sink.commit_timestamps(), vec![1, 2, 3, 4, 5]);
        assert_eq!(publisher.save_point(), 5);

        // Nothing new is complete yet
        assert_eq!(publisher.publish_pass(&cancel).await.unwrap(), 0);

        fx.window.persist_lower(11).unwrap();
        assert_eq!(publisher.publish_pass(&cancel).await.unwrap(), 5);
        assert_eq!(sink.commit_timestamps(), (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_restart_resumes_after_save_point() {
        let fx = Fixture::new();
        fx.write([2, 4, 6, 8]);
        fx.window.persist_lower(5).unwrap();

        let first = MemorySink::new();
        let mut publisher = fx.publisher(first.clone());
        publisher.publish_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.commit_timestamps(), vec![2, 4]);
        drop(publisher);

        fx.window.persist_lower(100).unwrap();
        let second = MemorySink::new();
        let mut publisher = fx.publisher(second.clone());
        assert_eq!(publisher.save_point(), 4);
        publisher.publish_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.commit_timestamps(), vec![6, 8]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_not_skipped() {
        let fx = Fixture::new();
        fx.write(1..=3);
        fx.window.persist_lower(4).unwrap();

        let sink = MemorySink::new();
        sink.fail_next(2);
        let mut publisher = fx.publisher(sink.clone());
        publisher.publish_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(sink.commit_timestamps(), vec![1, 2, 3]);
        assert_eq!(sink.attempts(), 5);
        assert_eq!(publisher.report().retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_name_the_entry() {
        let fx = Fixture::new();
        fx.write(1..=3);
        fx.window.persist_lower(4).unwrap();

        let sink = MemorySink::new();
        let mut publisher = fx.publisher(sink.clone());
        publisher.publish_pass(&CancellationToken::new()).await.unwrap();

        fx.write([7]);
        fx.window.persist_lower(10).unwrap();
        sink.fail_next(100);
        let err = publisher
            .publish_pass(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Exhausted {
                commit_ts: 7,
                attempts: 5,
                ..
            }
        ));
        assert_eq!(publisher.save_point(), 3);
    }

    /// Never answers the first call
    struct StallOnceSink {
        calls: AtomicU64,
        inner: MemorySink,
    }

    impl Sink for StallOnceSink {
        fn deliver<'a>(
            &'a self,
            entry: &'a Entry,
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
            Box::pin(async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::future::pending::<()>().await;
                }
                self.inner.deliver(entry).await
            })
        }
    }

    #[tokio::test]
    async fn test_delivery_timeout_is_retried() {
        let fx = Fixture::new();
        fx.write([1]);
        fx.window.persist_lower(2).unwrap();

        let inner = MemorySink::new();
        let mut publisher = fx.publisher(StallOnceSink {
            calls: AtomicU64::new(0),
            inner: inner.clone(),
        });
        publisher.publish_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(inner.commit_timestamps(), vec![1]);
        assert_eq!(publisher.report().retries, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_fatal() {
        let fx = Fixture::new();
        fx.write([1, 3]);
        fx.store.poke(&fx.ns.entries, &encode_commit_ts(2), b"garbage");
        fx.window.persist_lower(10).unwrap();

        let sink = MemorySink::new();
        let mut publisher = fx.publisher(sink.clone());
        let err = publisher
            .publish_pass(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Decode(_)));
        assert_eq!(sink.commit_timestamps(), vec![1]);
        assert_eq!(publisher.save_point(), 1);
    }

    #[tokio::test]
    async fn test_savepoint_batch_persists_at_pass_end() {
        let fx = Fixture::new();
        fx.write(1..=5);
        fx.window.persist_lower(6).unwrap();

        let mut config = PublisherConfig::test();
        config.savepoint_batch = 100;
        let mut publisher = Publisher::open(
            fx.store.clone(),
            fx.window.clone(),
            &fx.ns,
            MemorySink::new(),
            config,
            4,
        )
        .unwrap();
        publisher.publish_pass(&CancellationToken::new()).await.unwrap();

        let reopened = SavePoint::open(fx.store.clone(), &fx.ns.savepoint, 0).unwrap();
        assert_eq!(reopened.get(), 5);
    }

    #[tokio::test]
    async fn test_run_follows_window_until_cancelled() {
        let fx = Fixture::new();
        let sink = MemorySink::new();
        let publisher = fx.publisher(sink.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(publisher.run(cancel.clone()));

        fx.write(1..=4);
        fx.window.persist_lower(3).unwrap();
        for _ in 0..200 {
            if sink.commit_timestamps().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.window.persist_lower(5).unwrap();
        for _ in 0..200 {
            if sink.commit_timestamps().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(sink.commit_timestamps(), vec![1, 2, 3, 4]);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.save_point, 4);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_keeps_save_point() {
        let fx = Fixture::new();
        fx.write(1..=2);
        fx.window.persist_lower(3).unwrap();

        let sink = MemorySink::new();
        sink.fail_next(u64::MAX);
        let mut config = PublisherConfig::test();
        config.retry.max_attempts = None;
        let publisher = Publisher::open(
            fx.store.clone(),
            fx.window.clone(),
            &fx.ns,
            sink.clone(),
            config,
            4,
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(publisher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.save_point, 0);
        assert!(sink.attempts() > 1);
    }
}
