//! Server Lifecycle
//!
//! Owns the store, window, collector, and publisher, and moves through
//! `Created -> Running -> Draining -> Closed`.
//!
//! ## Shutdown order
//!
//! 1. Draining: new producers and range queries are rejected
//! 2. Cancel the shared token
//! 3. Join producer tasks, the publisher, and the status reporter
//! 4. Sync and close the store

use crate::collector::{CollectError, Collector, ProducerHandle, ProducerReport};
use crate::codec::ProducerId;
use crate::config::{ConfigError, ServerConfig};
use crate::publisher::{PublishError, Publisher, PublisherReport};
use crate::range_query::{range_query_paged, RangeQueryResult};
use crate::sink::Sink;
use crate::store::{FileStore, Namespaces, Store, StoreError};
use crate::window::{Window, WindowBounds, WindowError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Draining,
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Running => "running",
            ServerState::Draining => "draining",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Error type for server operations
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Store(StoreError),
    Window(WindowError),
    Publish(PublishError),
    Collect(CollectError),
    /// Operation not allowed in the current state
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{}", e),
            ServerError::Store(e) => write!(f, "{}", e),
            ServerError::Window(e) => write!(f, "{}", e),
            ServerError::Publish(e) => write!(f, "{}", e),
            ServerError::Collect(e) => write!(f, "{}", e),
            ServerError::InvalidState { operation, state } => {
                write!(f, "cannot {} while server is {}", operation, state)
            }
        }
    }
}

impl std::error::Error for ServerError {}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Store(e)
    }
}

impl From<WindowError> for ServerError {
    fn from(e: WindowError) -> Self {
        ServerError::Window(e)
    }
}

impl From<PublishError> for ServerError {
    fn from(e: PublishError) -> Self {
        ServerError::Publish(e)
    }
}

impl From<CollectError> for ServerError {
    fn from(e: CollectError) -> Self {
        ServerError::Collect(e)
    }
}

/// Outcome of every background task, collected by `close`
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// `None` if the publisher never started
    pub publisher: Option<Result<PublisherReport, PublishError>>,
    pub producers: Vec<Result<ProducerReport, CollectError>>,
    /// Window bounds at close
    pub window: WindowBounds,
}

/// CDC aggregation server
pub struct Server<S: Store, K: Sink> {
    config: ServerConfig,
    store: Arc<S>,
    namespaces: Namespaces,
    window: Arc<Window<S>>,
    collector: Arc<Collector<S>>,
    publisher: Mutex<Option<Publisher<S, K>>>,
    state: Mutex<ServerState>,
    cancel: CancellationToken,
    publisher_task: Mutex<Option<JoinHandle<Result<PublisherReport, PublishError>>>>,
    /// Set when the publisher stops on its own with an error
    publisher_failure: Arc<Mutex<Option<String>>>,
    reporter_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K: Sink> Server<FileStore, K> {
    /// Open the file store under `config.data_dir`.
    pub fn open(config: ServerConfig, sink: K) -> Result<Self, ServerError> {
        config.validate()?;
        let namespaces = Namespaces::for_cluster(config.cluster_id);
        let store = FileStore::open(
            &config.data_dir,
            &namespaces.all(),
            config.store.sync_writes,
        )?;
        info!("Store opened at {}", store.path().display());
        Self::with_store(Arc::new(store), config, sink)
    }
}

impl<S: Store, K: Sink> Server<S, K> {
    /// Build a server over an already opened store.
    pub fn with_store(store: Arc<S>, config: ServerConfig, sink: K) -> Result<Self, ServerError> {
        let namespaces = Namespaces::for_cluster(config.cluster_id);
        let cancel = CancellationToken::new();
        let window = Arc::new(Window::open(store.clone(), &namespaces.window)?);
        let collector = Arc::new(Collector::open(
            store.clone(),
            window.clone(),
            namespaces.clone(),
            config.collector.clone(),
            cancel.clone(),
        )?);
        let publisher = Publisher::open(
            store.clone(),
            window.clone(),
            &namespaces,
            sink,
            config.publisher.clone(),
            config.store.scan_page_size,
        )?;

        let bounds = window.bounds();
        info!(
            "Server created for cluster {}: lower={} upper={} save_point={}",
            config.cluster_id,
            bounds.lower,
            bounds.upper,
            publisher.save_point()
        );

        Ok(Server {
            config,
            store,
            namespaces,
            window,
            collector,
            publisher: Mutex::new(Some(publisher)),
            state: Mutex::new(ServerState::Created),
            cancel,
            publisher_task: Mutex::new(None),
            publisher_failure: Arc::new(Mutex::new(None)),
            reporter_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }

    pub fn window_bounds(&self) -> WindowBounds {
        self.window.bounds()
    }

    /// Why the publisher stopped, if it stopped before `close`.
    ///
    /// The server keeps accepting producers and range queries; nothing is
    /// delivered downstream until it is restarted.
    pub fn publisher_failure(&self) -> Option<String> {
        self.publisher_failure.lock().clone()
    }

    /// Spawn the publisher and status reporter. Must be called from a Tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        if *state != ServerState::Created {
            return Err(ServerError::InvalidState {
                operation: "start",
                state: *state,
            });
        }
        let Some(publisher) = self.publisher.lock().take() else {
            return Err(ServerError::InvalidState {
                operation: "start",
                state: *state,
            });
        };

        let run = publisher.run(self.cancel.clone());
        let failure = self.publisher_failure.clone();
        *self.publisher_task.lock() = Some(tokio::spawn(async move {
            let outcome = run.await;
            if let Err(e) = &outcome {
                error!("Publisher stopped, nothing will be delivered until restart: {}", e);
                *failure.lock() = Some(e.to_string());
            }
            outcome
        }));
        *self.reporter_task.lock() = Some(tokio::spawn(report_status(
            self.window.clone(),
            self.collector.clone(),
            self.publisher_failure.clone(),
            self.config.metrics_addr.clone(),
            self.config.metrics_interval,
            self.cancel.clone(),
        )));

        *state = ServerState::Running;
        info!(
            "Server running (listen {}, data {})",
            self.config.listen_addr,
            self.config.data_dir.display()
        );
        Ok(())
    }

    fn require_running(&self, operation: &'static str) -> Result<(), ServerError> {
        let state = *self.state.lock();
        if state != ServerState::Running {
            return Err(ServerError::InvalidState { operation, state });
        }
        Ok(())
    }

    /// Register a producer and spawn its ingestion task.
    pub fn connect_producer(&self, producer: ProducerId) -> Result<ProducerHandle, ServerError> {
        self.require_running("connect producer")?;
        Ok(self.collector.connect(producer)?)
    }

    /// Drop a stalled producer from the window minimum.
    pub fn exclude_producer(&self, producer: &ProducerId) -> Result<WindowBounds, ServerError> {
        self.require_running("exclude producer")?;
        Ok(self.collector.exclude(producer)?)
    }

    /// Read complete entries after `begin_commit_ts`.
    pub fn range_query(&self, begin_commit_ts: i64, limit: i32) -> Result<RangeQueryResult, ServerError> {
        self.require_running("range query")?;
        Ok(range_query_paged(
            self.store.as_ref(),
            &self.window,
            &self.namespaces.entries,
            begin_commit_ts,
            limit,
            self.config.store.scan_page_size,
        ))
    }

    /// Drain background work and close the store.
    pub async fn close(&self) -> Result<ShutdownReport, ServerError> {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Created | ServerState::Running => {}
                other => {
                    return Err(ServerError::InvalidState {
                        operation: "close",
                        state: other,
                    })
                }
            }
            *state = ServerState::Draining;
        }
        info!("Server draining");
        self.cancel.cancel();

        let mut report = ShutdownReport {
            producers: self.collector.join().await,
            ..Default::default()
        };

        let publisher_task = self.publisher_task.lock().take();
        if let Some(task) = publisher_task {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Publisher task aborted: {}", e);
                    Err(PublishError::Aborted(e.to_string()))
                }
            };
            report.publisher = Some(outcome);
        }
        let reporter_task = self.reporter_task.lock().take();
        if let Some(task) = reporter_task {
            if let Err(e) = task.await {
                warn!("Status reporter aborted: {}", e);
            }
        }

        report.window = self.window.bounds();
        let closed = self.store.sync().and_then(|_| self.store.close());
        *self.state.lock() = ServerState::Closed;
        closed?;

        info!(
            "Server closed: lower={} upper={}",
            report.window.lower, report.window.upper
        );
        Ok(report)
    }
}

/// Periodically log the window position.
async fn report_status<S: Store>(
    window: Arc<Window<S>>,
    collector: Arc<Collector<S>>,
    publisher_failure: Arc<Mutex<Option<String>>>,
    metrics_addr: Option<String>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    let target = metrics_addr.as_deref().unwrap_or("-");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let bounds = window.bounds();
                info!(
                    "status [{}]: lower={} upper={} producers={}",
                    target,
                    bounds.lower,
                    bounds.upper,
                    collector.watermarks().len()
                );
                if let Some(reason) = publisher_failure.lock().as_deref() {
                    warn!("status [{}]: publisher stopped: {}", target, reason);
                }
            }
        }
    }
}
