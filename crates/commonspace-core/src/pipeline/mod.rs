//! The register-to-common-space pipeline.
//!
//! A run goes through three phases, each made of cache-aware stage executions:
//!
//! 1. `brain_extraction` for every subject
//! 2. `brain_average` / `brain_affine`, repeated until the brain template
//!    settles or `brain_iterations` is reached
//! 3. `head_mask`, `head_init`, `head_average`, `head_affine`
//!
//! Every stage execution is keyed by a [`crate::fingerprint::StageFingerprint`]
//! over the content digests of its inputs and its parameters, so a rerun only
//! recomputes what actually changed.

mod brain;
mod context;
mod head;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, Instrument};

use crate::backend::RegistrationBackend;
use crate::cas::Digest;
use crate::config::EngineSettings;
use crate::error::{PipelineError, Result};
use crate::job::{prepare_output_dir, RegistrationJob};
use crate::metrics::RunStats;
use crate::obs;

use context::RunContext;

/// What a run hands back. Paths live under the job's output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub run_id: String,
    /// One registered image per input, in input order.
    pub registered: Vec<PathBuf>,
    /// Whole-head template every image was registered to.
    pub template: PathBuf,
    /// Final brain template.
    pub brain_template: PathBuf,
    /// Per-subject head affine, in input order. It maps the subject's
    /// `head_init` image, which is already in brain-template space, onto
    /// `template`; apply the matching `brain_transforms` entry first to go
    /// from the input scan.
    pub transforms: Vec<PathBuf>,
    /// Per-subject brain affine of the last brain iteration, in input order.
    /// Maps the input scan onto `brain_template`.
    pub brain_transforms: Vec<PathBuf>,
    /// Brain iterations actually run.
    pub brain_iterations: u32,
    pub stats: RunStats,
}

/// Runs registration jobs against one backend with fixed settings.
#[derive(Clone)]
pub struct PipelineEngine {
    backend: Arc<dyn RegistrationBackend>,
    settings: EngineSettings,
}

impl PipelineEngine {
    pub fn new(backend: Arc<dyn RegistrationBackend>, settings: EngineSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register every image of `job` to a common template.
    ///
    /// Nothing is written before the job and settings validate and the output
    /// directory proves writable. The first failing stage ends the run with
    /// [`PipelineError::Stage`]; stages finished before it stay cached.
    pub async fn run(&self, job: &RegistrationJob) -> Result<RegistrationResult> {
        job.validate()?;
        self.settings.validate()?;
        prepare_output_dir(&job.output_dir)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        async {
            obs::emit_run_started(&run_id, job.images.len(), job.caching);
            let start = Instant::now();
            match self.execute(job, &run_id).await {
                Ok(result) => {
                    obs::emit_run_finished(&run_id, start.elapsed().as_millis() as u64, &result.stats);
                    Ok(result)
                }
                Err(e) => {
                    obs::emit_run_failed(&run_id, &e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &RegistrationJob, run_id: &str) -> Result<RegistrationResult> {
        let ctx = RunContext::new(job, &self.settings, self.backend.as_ref())?;

        let images = job
            .images
            .iter()
            .map(|p| Digest::of_file(p).map_err(|e| PipelineError::io(p, e)))
            .collect::<Result<Vec<_>>>()?;
        debug!(subjects = images.len(), "input images hashed");

        let brain = ctx.brain_phase(&images).await?;
        let head = ctx.head_phase(&images, &brain).await?;
        ctx.metrics.flush(run_id);

        Ok(RegistrationResult {
            run_id: run_id.to_string(),
            registered: head.registered.iter().map(|f| ctx.path_of(f)).collect(),
            template: ctx.path_of(&head.template),
            brain_template: ctx.path_of(&brain.template),
            transforms: head.transforms.iter().map(|f| ctx.path_of(f)).collect(),
            brain_transforms: brain.transforms.iter().map(|f| ctx.path_of(f)).collect(),
            brain_iterations: brain.iterations,
            stats: ctx.metrics.snapshot(),
        })
    }
}

/// Register `images` to a common template written under `output_dir`, with
/// default [`EngineSettings`].
pub async fn run(
    backend: Arc<dyn RegistrationBackend>,
    images: Vec<PathBuf>,
    output_dir: impl Into<PathBuf>,
    resolution: f64,
    use_rats_tool: bool,
    caching: bool,
) -> Result<RegistrationResult> {
    let job = RegistrationJob::new(images, output_dir, resolution)
        .with_rats_tool(use_rats_tool)
        .with_caching(caching);
    PipelineEngine::new(backend, EngineSettings::default())
        .run(&job)
        .await
}
