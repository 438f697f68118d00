//! Simulated Store with Fault Injection
//!
//! DST-compatible wrapper that injects faults from a seeded RNG, so the
//! same seed always fails the same operations.

use super::{KvPair, Store, StoreError, WriteBatch};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::ops::Bound;
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of write batch failure
    pub write_fail_prob: f64,
    /// Probability of GET failure
    pub get_fail_prob: f64,
    /// Probability of scan page failure
    pub scan_fail_prob: f64,
    /// Probability of sync failure
    pub sync_fail_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            write_fail_prob: 0.01,
            get_fail_prob: 0.005,
            scan_fail_prob: 0.005,
            sync_fail_prob: 0.005,
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            write_fail_prob: 0.05,
            get_fail_prob: 0.02,
            scan_fail_prob: 0.02,
            sync_fail_prob: 0.02,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            write_fail_prob: 0.0,
            get_fail_prob: 0.0,
            scan_fail_prob: 0.0,
            sync_fail_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub write_attempts: u64,
    pub write_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub scan_attempts: u64,
    pub scan_failures: u64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
    /// Writes let through before forced failures start
    forced_write_skip: u64,
    /// Writes forced to fail regardless of probability
    forced_write_failures: u64,
}

/// Store wrapper that injects faults. Clones share RNG and statistics.
pub struct SimulatedStore<S: Store> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: Store + Clone> Clone for SimulatedStore<S> {
    fn clone(&self) -> Self {
        SimulatedStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Store> SimulatedStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
                forced_write_skip: 0,
                forced_write_failures: 0,
            })),
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Make the next `n` write batches fail
    pub fn fail_next_writes(&self, n: u64) {
        self.fail_writes_after(0, n);
    }

    /// Let `skip` write batches through, then fail the following `n`
    pub fn fail_writes_after(&self, skip: u64, n: u64) {
        let mut state = self.state.lock();
        state.forced_write_skip = skip;
        state.forced_write_failures = n;
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    fn roll(&self, prob: f64) -> bool {
        prob > 0.0 && self.state.lock().rng.gen_bool(prob.min(1.0))
    }
}

impl<S: Store> Store for SimulatedStore<S> {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let forced = {
            let mut state = self.state.lock();
            state.stats.write_attempts += 1;
            if state.forced_write_skip > 0 {
                state.forced_write_skip -= 1;
                false
            } else if state.forced_write_failures > 0 {
                state.forced_write_failures -= 1;
                true
            } else {
                false
            }
        };
        if forced || self.roll(self.config.write_fail_prob) {
            self.state.lock().stats.write_failures += 1;
            return Err(StoreError::Injected(format!(
                "write batch of {} ops failed",
                batch.len()
            )));
        }
        self.inner_store.write_batch(batch)
    }

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.state.lock().stats.get_attempts += 1;
        if self.roll(self.config.get_fail_prob) {
            self.state.lock().stats.get_failures += 1;
            return Err(StoreError::Injected(format!(
                "get {:?} in {} failed",
                key, namespace
            )));
        }
        self.inner_store.get(namespace, key)
    }

    fn scan_page(
        &self,
        namespace: &str,
        from: Bound<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvPair>, StoreError> {
        self.state.lock().stats.scan_attempts += 1;
        if self.roll(self.config.scan_fail_prob) {
            self.state.lock().stats.scan_failures += 1;
            return Err(StoreError::Injected(format!("scan of {} failed", namespace)));
        }
        self.inner_store.scan_page(namespace, from, limit)
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.state.lock().stats.sync_attempts += 1;
        if self.roll(self.config.sync_fail_prob) {
            self.state.lock().stats.sync_failures += 1;
            return Err(StoreError::Injected("sync failed".to_string()));
        }
        self.inner_store.sync()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner_store.close()
    }
}
