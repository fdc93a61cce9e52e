//! Structured observability hooks for the pipeline lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span for `Instrument`-ing the run future
//! - Emission functions for run start/finish/failure and per-stage cache outcomes
//!
//! Events are emitted at `info!` level, recoveries at `warn!`.

use tracing::{info, warn};

use crate::fingerprint::StageFingerprint;
use crate::metrics::RunStats;

/// Span every event of one run is recorded under.
///
/// Attach it with [`tracing::Instrument::instrument`] rather than entering it,
/// so the run future stays `Send`.
///
/// # Example
///
/// ```ignore
/// engine_work().instrument(run_span("run-12345")).await;
/// // every event inside carries run_id = "run-12345"
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("commonspace.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, subjects: usize, caching: bool) {
    info!(event = "run.started", run_id = %run_id, subjects = subjects, caching = caching);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, stats: &RunStats) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        computed = stats.computed,
        cached = stats.cached,
        recovered = stats.recovered,
    );
}

pub fn emit_run_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, error = %error);
}

pub fn emit_stage_cache_hit(stage: &str, subject: Option<usize>, fingerprint: &StageFingerprint) {
    info!(
        event = "stage.cache_hit",
        stage = %stage,
        subject = ?subject,
        fingerprint = %fingerprint.short(),
    );
}

pub fn emit_stage_computed(stage: &str, subject: Option<usize>, fingerprint: &StageFingerprint, duration_ms: u64) {
    info!(
        event = "stage.computed",
        stage = %stage,
        subject = ?subject,
        fingerprint = %fingerprint.short(),
        duration_ms = duration_ms,
    );
}

/// A cache entry could not be used; the stage will be recomputed.
pub fn emit_cache_recovered(stage: &str, subject: Option<usize>, reason: &dyn std::fmt::Display) {
    warn!(event = "cache.recovered", stage = %stage, subject = ?subject, reason = %reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
    }
}
