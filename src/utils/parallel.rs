//! Parallel execution configuration

use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::Result;

/// Configuration for parallel evaluation
///
/// When disabled, neighbor search and MCD restarts run on a single worker
/// and no thread pool is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Whether parallel evaluation is enabled
    pub enabled: bool,
    /// Number of threads (None = use all available)
    pub n_threads: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            n_threads: None,
        }
    }
}

impl ParallelConfig {
    /// Create a new, sequential configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parallel configuration using all available threads
    pub fn parallel() -> Self {
        Self {
            enabled: true,
            n_threads: None,
        }
    }

    /// Enable parallelism with a fixed number of threads
    pub fn with_threads(mut self, n: usize) -> Self {
        self.enabled = true;
        self.n_threads = Some(n.max(1));
        self
    }

    /// Toggle parallel evaluation
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Get the number of threads to use
    pub fn num_threads(&self) -> usize {
        if !self.enabled {
            return 1;
        }
        self.n_threads.unwrap_or_else(rayon::current_num_threads).max(1)
    }

    /// Run `op` inside a thread pool sized by this configuration.
    ///
    /// Disabled configurations run `op` on the calling thread without
    /// building a pool; enabled ones without an explicit thread count reuse
    /// the global rayon pool. Pools for an explicit thread count are built
    /// once and shared.
    pub fn install<R, F>(&self, op: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match (self.enabled, self.n_threads) {
            (false, _) | (true, None) => Ok(op()),
            (true, Some(n)) => Ok(shared_pool(n.max(1))?.install(op)),
        }
    }
}

/// Process-wide pool with `threads` workers, built on first use.
fn shared_pool(threads: usize) -> Result<Arc<ThreadPool>> {
    static POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();

    let mut pools = POOLS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(pool) = pools.get(&threads) {
        return Ok(Arc::clone(pool));
    }
    let pool = Arc::new(
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("anomaly-{threads}-{i}"))
            .build()?,
    );
    debug!(threads, "Built worker pool");
    pools.insert(threads, Arc::clone(&pool));
    Ok(pool)
}

/// Split `0..len` into at most `parts` contiguous, near-equal ranges.
pub fn split_ranges(len: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    let parts = parts.clamp(1, len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for p in 0..parts {
        let end = start + base + usize::from(p < extra);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Parallel map over `0..len` with configuration
pub fn parallel_map_indexed<U, F>(len: usize, config: &ParallelConfig, f: F) -> Result<Vec<U>>
where
    U: Send,
    F: Fn(usize) -> U + Send + Sync,
{
    config.install(|| (0..len).into_par_iter().map(f).collect())
}
