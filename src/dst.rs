//! Deterministic Simulation Testing Harness
//!
//! Drives several producers, the publisher, range queries, and crashes in a
//! seeded random interleaving over a fault-injecting store, and checks after
//! every step:
//!
//! - **Monotonicity**: window `lower` and `upper` never regress, across crashes too
//! - **Completeness**: nothing at or above `lower` reaches the sink or a range query
//! - **Order**: the sink sees commit timestamps `1, 2, 3, ...` with no gaps
//! - **Resumability**: the only repeat allowed is the last unconfirmed entry
//! - **Crash consistency**: a restart comes back with the pre-crash bounds
//! - **Stability**: no write lands at or below `lower`, and an entry seen
//!   complete never changes (every session writes distinct payloads)
//!
//! ## DST Methodology
//!
//! 1. Assign commit timestamps `1..=N` to producers at random (each stream ordered)
//! 2. Register every producer, then interleave deliveries, heartbeats,
//!    publisher passes, range queries, and crash/restart
//! 3. Failed store operations end the affected session or publisher; they
//!    are reopened and must resume without loss
//! 4. Producers that have written their whole stream may be excluded while
//!    their session is open; that session must be refused from then on
//! 5. Run until the sink has seen all `N` entries

use crate::codec::ProducerId;
use crate::collector::{CollectError, Collector, IngestSession};
use crate::config::{CollectorConfig, PublisherConfig, RetryPolicy};
use crate::publisher::Publisher;
use crate::range_query::range_query_paged;
use crate::sink::MemorySink;
use crate::store::{
    InMemoryStore, Namespaces, SimulatedStore, SimulatedStoreConfig, SimulatedStoreStats,
};
use crate::window::{Window, WindowBounds};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type SimStore = SimulatedStore<InMemoryStore>;

/// Attempts to reopen components before a run is declared failed
const OPEN_ATTEMPTS: usize = 100;

/// Result of a single DST run
#[derive(Debug)]
pub struct DSTResult {
    pub seed: u64,
    pub entries: usize,
    pub steps: usize,
    pub crashes: usize,
    pub session_failures: usize,
    pub publisher_restarts: usize,
    pub queries: usize,
    pub delivered: usize,
    pub redelivered: usize,
    pub exclusions: usize,
    pub store_stats: SimulatedStoreStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the DST harness
#[derive(Debug, Clone)]
pub struct DSTConfig {
    /// Number of producers
    pub producers: usize,
    /// Total entries across all producers
    pub entries: usize,
    /// Per-step probability of a crash and restart
    pub crash_prob: f64,
    /// Per-step probability of a publisher pass
    pub publish_prob: f64,
    /// Per-step probability of a range query check
    pub query_prob: f64,
    /// Probability a producer step is a heartbeat instead of an entry
    pub heartbeat_prob: f64,
    /// Probability a publisher pass starts with sink failures queued
    pub sink_fail_prob: f64,
    /// Per-step probability of excluding a producer that wrote its whole stream
    pub exclude_prob: f64,
    /// Store fault injection
    pub store_config: SimulatedStoreConfig,
    /// Give up (and fail) after this many steps
    pub max_steps: usize,
}

impl Default for DSTConfig {
    fn default() -> Self {
        DSTConfig {
            producers: 3,
            entries: 200,
            crash_prob: 0.01,
            publish_prob: 0.15,
            query_prob: 0.1,
            heartbeat_prob: 0.1,
            sink_fail_prob: 0.05,
            exclude_prob: 0.01,
            store_config: SimulatedStoreConfig::default(),
            max_steps: 50_000,
        }
    }
}

impl DSTConfig {
    /// No faults, no crashes
    pub fn calm() -> Self {
        DSTConfig {
            crash_prob: 0.0,
            sink_fail_prob: 0.0,
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Crashes without store faults
    pub fn crash_only() -> Self {
        DSTConfig {
            crash_prob: 0.03,
            sink_fail_prob: 0.0,
            store_config: SimulatedStoreConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Store faults, sink failures, and crashes
    pub fn chaos() -> Self {
        DSTConfig {
            crash_prob: 0.02,
            sink_fail_prob: 0.2,
            store_config: SimulatedStoreConfig::high_chaos(),
            ..Default::default()
        }
    }
}

/// Live components; replaced wholesale on restart
struct Node {
    window: Arc<Window<SimStore>>,
    collector: Collector<SimStore>,
    publisher: Option<Publisher<SimStore, MemorySink>>,
    sessions: Vec<Option<IngestSession<SimStore>>>,
}

struct Simulation {
    rng: ChaCha8Rng,
    config: DSTConfig,
    ns: Namespaces,
    store: Arc<SimStore>,
    sink: MemorySink,
    runtime: tokio::runtime::Runtime,
    /// Commit timestamps per producer, increasing
    queues: Vec<Vec<i64>>,
    /// Index of the next entry each producer sends
    cursors: Vec<usize>,
    /// Sessions opened per producer; part of every payload
    generations: Vec<u64>,
    excluded: Vec<bool>,
    /// Payload of every entry seen below `lower`
    complete: HashMap<i64, Bytes>,
    total: i64,
    last_bounds: WindowBounds,
    verified: usize,
    last_delivered: i64,
    steps: usize,
    crashes: usize,
    session_failures: usize,
    publisher_restarts: usize,
    queries: usize,
    redelivered: usize,
    exclusions: usize,
}

/// DST Harness
pub struct DSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: DSTConfig,
}

impl DSTHarness {
    pub fn new(seed: u64, config: DSTConfig) -> Self {
        DSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> DSTResult {
        let ns = Namespaces::for_cluster(1);
        let store = Arc::new(SimulatedStore::new(
            InMemoryStore::new(&ns.all()),
            self.rng.gen(),
            self.config.store_config.clone(),
        ));

        let mut queues = vec![Vec::new(); self.config.producers.max(1)];
        for ts in 1..=self.config.entries as i64 {
            let p = self.rng.gen_range(0..queues.len());
            queues[p].push(ts);
        }

        let failed = |message: String| DSTResult {
            seed: self.seed,
            entries: self.config.entries,
            steps: 0,
            crashes: 0,
            session_failures: 0,
            publisher_restarts: 0,
            queries: 0,
            delivered: 0,
            redelivered: 0,
            exclusions: 0,
            store_stats: store.stats(),
            passed: false,
            error_message: Some(message),
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => return failed(format!("Failed to build runtime: {}", e)),
        };

        let node = match open_node(&store, &ns, queues.len()) {
            Ok(node) => node,
            Err(e) => return failed(e),
        };
        let mut sim = Simulation {
            rng: ChaCha8Rng::seed_from_u64(self.rng.gen()),
            config: self.config.clone(),
            last_bounds: node.window.bounds(),
            ns,
            store,
            sink: MemorySink::new(),
            runtime,
            cursors: vec![0; queues.len()],
            generations: vec![0; queues.len()],
            excluded: vec![false; queues.len()],
            complete: HashMap::new(),
            queues,
            total: self.config.entries as i64,
            verified: 0,
            last_delivered: 0,
            steps: 0,
            crashes: 0,
            session_failures: 0,
            publisher_restarts: 0,
            queries: 0,
            redelivered: 0,
            exclusions: 0,
        };

        let outcome = sim.execute(node);
        DSTResult {
            seed: self.seed,
            entries: self.config.entries,
            steps: sim.steps,
            crashes: sim.crashes,
            session_failures: sim.session_failures,
            publisher_restarts: sim.publisher_restarts,
            queries: sim.queries,
            delivered: sim.verified,
            redelivered: sim.redelivered,
            exclusions: sim.exclusions,
            store_stats: sim.store.stats(),
            passed: outcome.is_ok(),
            error_message: outcome.err(),
        }
    }
}

fn producer_id(p: usize) -> ProducerId {
    ProducerId::new(format!("producer-{}", p))
}

fn payload(ts: i64, generation: u64) -> Bytes {
    Bytes::from(format!("{}:{}", ts, generation))
}

/// Commit timestamp a payload was written for
fn payload_ts(payload: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(payload).ok()?;
    text.split(':').next()?.parse().ok()
}

fn open_node(store: &Arc<SimStore>, ns: &Namespaces, producers: usize) -> Result<Node, String> {
    let mut last_error = String::new();
    for _ in 0..OPEN_ATTEMPTS {
        let window = match Window::open(store.clone(), &ns.window) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };
        match Collector::open(
            store.clone(),
            window.clone(),
            ns.clone(),
            CollectorConfig::default(),
            CancellationToken::new(),
        ) {
            Ok(collector) => {
                return Ok(Node {
                    window,
                    collector,
                    publisher: None,
                    sessions: (0..producers).map(|_| None).collect(),
                })
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(format!("Reopen failed {} times: {}", OPEN_ATTEMPTS, last_error))
}

fn publisher_config() -> PublisherConfig {
    PublisherConfig {
        poll_interval: Duration::from_millis(1),
        savepoint_batch: 1,
        initial_commit_ts: 0,
        retry: RetryPolicy {
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts: Some(3),
        },
    }
}

impl Simulation {
    fn execute(&mut self, mut node: Node) -> Result<(), String> {
        // Every producer must be counted before the window can move
        for p in 0..self.queues.len() {
            let mut connected = false;
            for _ in 0..OPEN_ATTEMPTS {
                if self.connect(&mut node, p) {
                    connected = true;
                    break;
                }
            }
            if !connected {
                return Err(format!("Producer {} could not register", p));
            }
        }

        while self.last_delivered < self.total {
            if self.steps >= self.config.max_steps {
                return Err(format!(
                    "Did not converge in {} steps: delivered up to {} of {}, window {:?}",
                    self.steps,
                    self.last_delivered,
                    self.total,
                    node.window.bounds()
                ));
            }
            self.steps += 1;

            let roll: f64 = self.rng.gen();
            let crash = self.config.crash_prob;
            let publish = crash + self.config.publish_prob;
            let query = publish + self.config.query_prob;
            let exclude = query + self.config.exclude_prob;
            if roll < crash {
                node = self.crash(node)?;
            } else if roll < publish {
                self.publish(&mut node)?;
            } else if roll < query {
                self.query(&node)?;
            } else if roll < exclude {
                self.exclude(&node);
            } else {
                let p = self.rng.gen_range(0..self.queues.len());
                self.step_producer(&mut node, p)?;
            }
            self.check_window(&node)?;
        }
        Ok(())
    }

    /// Open a session for producer `p`. Returns false on a store fault.
    fn connect(&mut self, node: &mut Node, p: usize) -> bool {
        match node.collector.session(producer_id(p)) {
            Ok(session) => {
                let resume = session.last_seen();
                self.cursors[p] = self.queues[p].partition_point(|&ts| ts <= resume);
                self.generations[p] += 1;
                node.sessions[p] = Some(session);
                true
            }
            Err(_) => {
                self.session_failures += 1;
                false
            }
        }
    }

    /// Exclude a producer whose whole stream is durable, keeping its session.
    fn exclude(&mut self, node: &Node) {
        let finished: Vec<usize> = (0..self.queues.len())
            .filter(|&p| !self.excluded[p] && self.cursors[p] == self.queues[p].len())
            .collect();
        let remaining = self.excluded.iter().filter(|e| !**e).count();
        // Someone has to carry the window to the end
        if finished.is_empty() || remaining < 2 {
            return;
        }
        let p = finished[self.rng.gen_range(0..finished.len())];
        match node.collector.exclude(&producer_id(p)) {
            // A window failure still leaves the producer removed
            Ok(_) | Err(CollectError::Window { .. }) => {
                self.excluded[p] = true;
                self.exclusions += 1;
            }
            Err(_) => {}
        }
    }

    fn step_producer(&mut self, node: &mut Node, p: usize) -> Result<(), String> {
        if self.excluded[p] {
            let Some(mut session) = node.sessions[p].take() else {
                return Ok(());
            };
            return match session.heartbeat(self.total + 1) {
                Err(CollectError::Excluded(_)) => Ok(()),
                other => Err(format!(
                    "EXCLUSION VIOLATION: producer {} still accepted after exclusion: {:?}",
                    p, other
                )),
            };
        }
        if node.sessions[p].is_none() && !self.connect(node, p) {
            return Ok(());
        }
        let lower = node.window.load_lower();
        let Some(session) = node.sessions[p].as_mut() else {
            return Ok(());
        };

        let final_ts = self.total + 1;
        let queue = &self.queues[p];
        let outcome = match queue.get(self.cursors[p]) {
            Some(&ts) => {
                let idle_until = ts - 1;
                if idle_until > session.last_seen() && self.rng.gen_bool(self.config.heartbeat_prob) {
                    session.heartbeat(idle_until)
                } else {
                    let result = session.ingest(ts, payload(ts, self.generations[p]));
                    if result.is_ok() {
                        if ts <= lower {
                            return Err(format!(
                                "COMPLETENESS VIOLATION: producer {} wrote {} with lower at {}",
                                p, ts, lower
                            ));
                        }
                        self.cursors[p] += 1;
                    }
                    result
                }
            }
            None if session.last_seen() < final_ts => session.heartbeat(final_ts),
            None => return Ok(()),
        };

        match outcome {
            Ok(_) => Ok(()),
            Err(e @ CollectError::OutOfOrder { .. }) => {
                Err(format!("Producer {} rejected its own ordered stream: {}", p, e))
            }
            Err(_) => {
                node.sessions[p] = None;
                self.session_failures += 1;
                Ok(())
            }
        }
    }

    fn publish(&mut self, node: &mut Node) -> Result<(), String> {
        if node.publisher.is_none() {
            match Publisher::open(
                self.store.clone(),
                node.window.clone(),
                &self.ns,
                self.sink.clone(),
                publisher_config(),
                4,
            ) {
                Ok(publisher) => node.publisher = Some(publisher),
                Err(_) => {
                    self.publisher_restarts += 1;
                    return Ok(());
                }
            }
        }
        let Some(publisher) = node.publisher.as_mut() else {
            return Ok(());
        };

        if self.config.sink_fail_prob > 0.0 && self.rng.gen_bool(self.config.sink_fail_prob) {
            self.sink.fail_next(self.rng.gen_range(1..=4));
        }
        let lower = node.window.load_lower();
        let cancel = CancellationToken::new();
        if self
            .runtime
            .block_on(publisher.publish_pass(&cancel))
            .is_err()
        {
            node.publisher = None;
            self.publisher_restarts += 1;
        }
        self.verify_sink(lower)
    }

    fn verify_sink(&mut self, lower: i64) -> Result<(), String> {
        let delivered = self.sink.delivered();
        for entry in &delivered[self.verified..] {
            let ts = entry.commit_ts;
            if ts >= lower {
                return Err(format!(
                    "COMPLETENESS VIOLATION: delivered {} with lower at {}",
                    ts, lower
                ));
            }
            if payload_ts(&entry.payload) != Some(ts) {
                return Err(format!("Payload mismatch at {}", ts));
            }
            self.check_stable(ts, &entry.payload)?;
            if ts == self.last_delivered {
                self.redelivered += 1;
            } else if ts != self.last_delivered + 1 {
                return Err(format!(
                    "ORDER VIOLATION: delivered {} after {}",
                    ts, self.last_delivered
                ));
            }
            self.last_delivered = ts;
        }
        self.verified = delivered.len();
        Ok(())
    }

    fn query(&mut self, node: &Node) -> Result<(), String> {
        self.queries += 1;
        let begin = self.rng.gen_range(-2..=self.total + 1);
        let limit: i32 = self.rng.gen_range(-1..=8);
        let lower = node.window.load_lower();
        let result = range_query_paged(
            self.store.as_ref(),
            &node.window,
            &self.ns.entries,
            begin,
            limit,
            3,
        );

        let first = (begin + 1).max(1);
        let available = (lower - first).max(0);
        let expected = if limit <= 0 {
            0
        } else {
            available.min(limit as i64) as usize
        };
        if result.payloads.len() > expected
            || (result.error.is_none() && result.payloads.len() != expected)
        {
            return Err(format!(
                "RANGE VIOLATION: begin={} limit={} lower={} returned {} (expected {}), error {:?}",
                begin,
                limit,
                lower,
                result.payloads.len(),
                expected,
                result.error
            ));
        }
        for (i, payload) in result.payloads.iter().enumerate() {
            let want = first + i as i64;
            if payload_ts(payload) != Some(want) {
                return Err(format!(
                    "RANGE VIOLATION: begin={} position {} holds {:?}, expected {}",
                    begin, i, payload, want
                ));
            }
            self.check_stable(want, payload)?;
        }
        let end = if result.payloads.is_empty() {
            begin
        } else {
            first + result.payloads.len() as i64 - 1
        };
        if result.end_commit_ts != end {
            return Err(format!(
                "RANGE VIOLATION: end_commit_ts {} expected {}",
                result.end_commit_ts, end
            ));
        }
        Ok(())
    }

    /// A complete entry must read back the same every time.
    fn check_stable(&mut self, ts: i64, payload: &Bytes) -> Result<(), String> {
        match self.complete.get(&ts) {
            Some(first) if first != payload => Err(format!(
                "COMPLETENESS VIOLATION: entry {} was {:?}, now {:?}",
                ts, first, payload
            )),
            Some(_) => Ok(()),
            None => {
                self.complete.insert(ts, payload.clone());
                Ok(())
            }
        }
    }

    fn crash(&mut self, node: Node) -> Result<Node, String> {
        self.crashes += 1;
        let before = node.window.bounds();
        drop(node);
        self.store.inner().simulate_crash();

        let node = open_node(&self.store, &self.ns, self.queues.len())?;
        let after = node.window.bounds();
        if after != before {
            return Err(format!(
                "CRASH CONSISTENCY VIOLATION: bounds {:?} before crash, {:?} after",
                before, after
            ));
        }
        Ok(node)
    }

    fn check_window(&mut self, node: &Node) -> Result<(), String> {
        let bounds = node.window.bounds();
        if bounds.lower < self.last_bounds.lower || bounds.upper < self.last_bounds.upper {
            return Err(format!(
                "MONOTONICITY VIOLATION: window {:?} after {:?}",
                bounds, self.last_bounds
            ));
        }
        if bounds.lower > bounds.upper {
            return Err(format!("Window lower above upper: {:?}", bounds));
        }
        self.last_bounds = bounds;
        Ok(())
    }
}

/// Run a batch of DST tests across multiple seeds
pub fn run_dst_batch(seeds: std::ops::Range<u64>, config: DSTConfig) -> Vec<DSTResult> {
    seeds
        .map(|seed| {
            let mut harness = DSTHarness::new(seed, config.clone());
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_batch(results: &[DSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let steps: usize = results.iter().map(|r| r.steps).sum();
    let crashes: usize = results.iter().map(|r| r.crashes).sum();
    let delivered: usize = results.iter().map(|r| r.delivered).sum();
    let redelivered: usize = results.iter().map(|r| r.redelivered).sum();
    let session_failures: usize = results.iter().map(|r| r.session_failures).sum();
    let exclusions: usize = results.iter().map(|r| r.exclusions).sum();
    let write_failures: u64 = results.iter().map(|r| r.store_stats.write_failures).sum();

    let mut summary = format!(
        "Cistern DST Batch: {}/{} passed ({} failed)\n\
         Steps: {}, Crashes: {}, Delivered: {} ({} redelivered), \
         Session failures: {}, Exclusions: {}, Injected write failures: {}",
        passed,
        total,
        failed,
        steps,
        crashes,
        delivered,
        redelivered,
        session_failures,
        exclusions,
        write_failures
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calm_run_delivers_everything() {
        let result = DSTHarness::new(7, DSTConfig::calm()).run();
        assert!(result.passed, "{:?}", result.error_message);
        assert_eq!(result.delivered, 200);
        assert_eq!(result.redelivered, 0);
    }

    #[test]
    fn test_same_seed_same_run() {
        let a = DSTHarness::new(11, DSTConfig::chaos()).run();
        let b = DSTHarness::new(11, DSTConfig::chaos()).run();
        assert_eq!(a.steps, b.steps);
        assert_eq!(a.crashes, b.crashes);
        assert_eq!(a.delivered, b.delivered);
    }

    #[test]
    fn test_exclusion_heavy_run() {
        let config = DSTConfig {
            exclude_prob: 0.2,
            ..DSTConfig::crash_only()
        };
        for seed in 0..5 {
            let result = DSTHarness::new(seed, config.clone()).run();
            assert!(result.passed, "seed {}: {:?}", seed, result.error_message);
            assert_eq!(result.delivered, result.entries + result.redelivered);
        }
    }

    #[test]
    fn test_payload_ts() {
        assert_eq!(payload_ts(&payload(17, 3)), Some(17));
        assert_eq!(payload_ts(b"garbage"), None);
    }

    #[test]
    fn test_summary_reports_failures() {
        let results = vec![DSTResult {
            seed: 3,
            entries: 1,
            steps: 1,
            crashes: 0,
            session_failures: 0,
            publisher_restarts: 0,
            queries: 0,
            delivered: 0,
            redelivered: 0,
            exclusions: 0,
            store_stats: SimulatedStoreStats::default(),
            passed: false,
            error_message: Some("boom".to_string()),
        }];
        let summary = summarize_batch(&results);
        assert!(summary.contains("0/1 passed"));
        assert!(summary.contains("Seed 3: boom"));
    }
}
