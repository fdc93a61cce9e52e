//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Upper bound on brain-to-brain averaging iterations.
pub const MAX_BRAIN_ITERATIONS: u32 = 10;

/// Settings that shape how a run executes. One value per engine; nothing global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Cap on register-then-average iterations of the brain phase. The loop
    /// stops earlier once the template stops changing.
    pub brain_iterations: u32,
    /// Voxels the brain mask is grown by to take in some scalp.
    pub scalp_dilation: u32,
    /// Per-subject stage executions in flight at once; 0 means one per CPU.
    pub max_parallel: usize,
    /// How long a cache writer waits for another writer of the same entry.
    pub lock_timeout_ms: u64,
    /// Lock files older than this are treated as abandoned.
    pub stale_lock_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            brain_iterations: 3,
            scalp_dilation: 4,
            max_parallel: 0,
            lock_timeout_ms: 10 * 60 * 1000,
            stale_lock_ms: 60 * 60 * 1000,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BRAIN_ITERATIONS).contains(&self.brain_iterations) {
            return Err(PipelineError::Input(format!(
                "brain_iterations must be between 1 and {MAX_BRAIN_ITERATIONS}, got {}",
                self.brain_iterations
            )));
        }
        Ok(())
    }

    /// Effective concurrency for per-subject stages.
    pub fn parallelism(&self) -> usize {
        if self.max_parallel > 0 {
            return self.max_parallel;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }
}
