//! Collector configuration

use crate::defaults::*;
use std::str::FromStr;

/// Collector configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Allow the reachability pass to use worker threads
    pub allow_parallel: bool,

    /// Worker threads used by a parallel pass
    pub worker_count: usize,

    /// Population share per worker; smaller populations use fewer workers
    pub min_objects_per_worker: usize,

    /// Local deque capacity per worker and wave
    pub local_queue_limit: usize,

    /// Destroy hook calls between time checks
    pub destroy_poll_interval: usize,

    /// Frees between time checks
    pub free_poll_interval: usize,

    /// Skipped `try_collect_garbage` calls before forcing a collection
    pub retries_before_forcing: u32,

    /// Track purge counts per type and log them after each purge
    pub detailed_stats: bool,

    /// Validate every traced reference against the object table
    pub verify_references: bool,

    /// Check permanent-pool and cluster assumptions before every pass
    pub verify_gc_assumptions: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            allow_parallel: DEFAULT_ALLOW_PARALLEL,
            worker_count: num_cpus::get(),
            min_objects_per_worker: DEFAULT_MIN_OBJECTS_PER_WORKER,
            local_queue_limit: DEFAULT_LOCAL_QUEUE_LIMIT,
            destroy_poll_interval: DEFAULT_DESTROY_POLL_INTERVAL,
            free_poll_interval: DEFAULT_FREE_POLL_INTERVAL,
            retries_before_forcing: DEFAULT_RETRIES_BEFORE_FORCING,
            detailed_stats: false,
            verify_references: true,
            verify_gc_assumptions: false,
        }
    }
}

impl GcConfig {
    /// Configuration that never spawns workers
    pub fn single_threaded() -> Self {
        Self {
            allow_parallel: false,
            worker_count: 1,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `TOKENGC_*` environment variables
    ///
    /// Recognised: `TOKENGC_ALLOW_PARALLEL`, `TOKENGC_WORKERS`,
    /// `TOKENGC_MIN_OBJECTS_PER_WORKER`, `TOKENGC_DETAILED_STATS`,
    /// `TOKENGC_VERIFY_ASSUMPTIONS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_flag("TOKENGC_ALLOW_PARALLEL") {
            config.allow_parallel = value;
        }
        if let Some(value) = env_value("TOKENGC_WORKERS") {
            config.worker_count = value;
        }
        if let Some(value) = env_value("TOKENGC_MIN_OBJECTS_PER_WORKER") {
            config.min_objects_per_worker = value;
        }
        if let Some(value) = env_flag("TOKENGC_DETAILED_STATS") {
            config.detailed_stats = value;
        }
        if let Some(value) = env_flag("TOKENGC_VERIFY_ASSUMPTIONS") {
            config.verify_gc_assumptions = value;
        }
        config
    }

    /// Set the worker count
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Workers to use for a pass over `population` objects
    ///
    /// Returns 1 when parallelism is disabled, fewer than two workers are
    /// configured, or the population is too small to split.
    pub fn effective_workers(&self, population: usize) -> usize {
        if !self.allow_parallel || self.worker_count < 2 {
            return 1;
        }
        let by_size = population / self.min_objects_per_worker.max(1);
        self.worker_count.min(by_size).max(1)
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            log::warn!("ignoring {}={:?}: expected a boolean", name, raw);
            None
        }
    }
}
