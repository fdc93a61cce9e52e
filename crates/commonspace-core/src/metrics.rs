//! Per-run atomic counters.
//!
//! Counters are incremented silently at the call site. Call
//! [`RunMetrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lightweight atomic counters, shared by the concurrent stage executions of one run.
#[derive(Debug, Default)]
pub struct RunMetrics {
    stages_computed: AtomicU64,
    cache_hits: AtomicU64,
    cache_recovered: AtomicU64,
}

/// Snapshot of [`RunMetrics`] handed back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Stage executions that called the backend.
    pub computed: u64,
    /// Stage executions answered from the cache.
    pub cached: u64,
    /// Cache entries found unusable and recomputed.
    pub recovered: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_computed(&self) {
        self.stages_computed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stages_computed", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_recovered(&self) {
        self.cache_recovered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_recovered", "counter incremented");
    }

    pub fn snapshot(&self) -> RunStats {
        RunStats {
            computed: self.stages_computed.load(Ordering::Relaxed),
            cached: self.cache_hits.load(Ordering::Relaxed),
            recovered: self.cache_recovered.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self, run_id: &str) {
        let stats = self.snapshot();
        tracing::info!(
            metric = "flush",
            run_id = %run_id,
            stages_computed = stats.computed,
            cache_hits = stats.cached,
            cache_recovered = stats.recovered,
        );
    }
}
