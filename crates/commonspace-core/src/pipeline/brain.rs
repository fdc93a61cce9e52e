//! Stages A and B: brain extraction, then the register-and-average loop.

use serde_json::json;
use tracing::info;

use super::context::{output, RunContext, StageSpec};
use crate::backend::{AffineRegistration, BrainExtraction};
use crate::cache::{ArtifactFile, CachedArtifact};
use crate::cas::Digest;
use crate::error::{PipelineError, Result};
use crate::stage::{Stage, IMAGE_EXT, TRANSFORM_EXT};

/// What the head stages need from the brain stages.
#[derive(Debug, Clone)]
pub(crate) struct BrainPhase {
    pub masks: Vec<ArtifactFile>,
    /// Template the final brain transforms point at.
    pub template: ArtifactFile,
    pub transforms: Vec<ArtifactFile>,
    pub iterations: u32,
}

fn collect(artifacts: &[CachedArtifact], role: &str) -> Result<Vec<ArtifactFile>> {
    artifacts.iter().map(|a| output(a, role)).collect()
}

impl RunContext<'_> {
    async fn extract_brain(&self, subject: usize, image: Digest) -> Result<CachedArtifact> {
        let method = self.job.extraction_method();
        let resolution = self.job.resolution;
        let brain = self
            .layout
            .subject_file(subject, Stage::BrainExtraction, None, "brain", IMAGE_EXT);
        let mask = self
            .layout
            .subject_file(subject, Stage::BrainExtraction, None, "brain_mask", IMAGE_EXT);

        let spec = StageSpec {
            stage: Stage::BrainExtraction,
            iteration: None,
            subject: Some(subject),
            inputs: vec![image],
            params: json!({
                "resolution": resolution,
                "use_rats_tool": self.job.use_rats_tool,
                "method": method.as_str(),
            }),
            outputs: vec![("brain", brain.clone()), ("brain_mask", mask.clone())],
        };
        let input = &self.job.images[subject];
        let (brain, mask) = (self.layout.abs(&brain), self.layout.abs(&mask));
        self.execute(spec, async move {
            self.backend
                .extract_brain(&BrainExtraction {
                    input,
                    brain_out: &brain,
                    mask_out: &mask,
                    method,
                    resolution,
                })
                .await
        })
        .await
    }

    async fn average_brains(&self, iteration: u32, brains: &[ArtifactFile]) -> Result<CachedArtifact> {
        let template = self
            .layout
            .global_file(Stage::BrainAverage, Some(iteration), "template", IMAGE_EXT);
        let spec = StageSpec {
            stage: Stage::BrainAverage,
            iteration: Some(iteration),
            subject: None,
            inputs: brains.iter().map(|b| b.digest).collect(),
            params: json!({ "resolution": self.job.resolution }),
            outputs: vec![("template", template.clone())],
        };
        let inputs: Vec<_> = brains.iter().map(|b| self.path_of(b)).collect();
        let template = self.layout.abs(&template);
        self.execute(spec, async move { self.backend.average(&inputs, &template).await })
            .await
    }

    async fn register_brain(
        &self,
        subject: usize,
        iteration: u32,
        brain: &ArtifactFile,
        template: &ArtifactFile,
    ) -> Result<CachedArtifact> {
        let resolution = self.job.resolution;
        let registered = self.layout.subject_file(
            subject,
            Stage::BrainAffine,
            Some(iteration),
            "registered",
            IMAGE_EXT,
        );
        let transform = self.layout.subject_file(
            subject,
            Stage::BrainAffine,
            Some(iteration),
            "transform",
            TRANSFORM_EXT,
        );

        let spec = StageSpec {
            stage: Stage::BrainAffine,
            iteration: Some(iteration),
            subject: Some(subject),
            inputs: vec![brain.digest, template.digest],
            params: json!({ "resolution": resolution }),
            outputs: vec![("registered", registered.clone()), ("transform", transform.clone())],
        };
        let (moving, reference) = (self.path_of(brain), self.path_of(template));
        let (registered, transform) = (self.layout.abs(&registered), self.layout.abs(&transform));
        self.execute(spec, async move {
            self.backend
                .affine_register(&AffineRegistration {
                    moving: &moving,
                    reference: &reference,
                    output: &registered,
                    transform_out: &transform,
                    weight: None,
                    resolution,
                })
                .await
        })
        .await
    }

    /// Extract every brain, then alternate averaging and registration until
    /// the template stops changing or the iteration cap is reached.
    pub(crate) async fn brain_phase(&self, images: &[Digest]) -> Result<BrainPhase> {
        let extracted = self
            .for_each_subject(|i| self.extract_brain(i, images[i]))
            .await?;
        let brains = collect(&extracted, "brain")?;
        let masks = collect(&extracted, "brain_mask")?;

        let mut current = brains.clone();
        let mut template: Option<ArtifactFile> = None;
        let mut transforms = Vec::new();
        let mut iterations = 0;

        for k in 1..=self.settings.brain_iterations {
            let averaged = output(&self.average_brains(k, &current).await?, "template")?;
            if template.as_ref().is_some_and(|t| t.digest == averaged.digest) {
                info!(
                    event = "brain.converged",
                    iteration = k,
                    digest = %averaged.digest.short(),
                    "brain template unchanged, stopping early"
                );
                break;
            }

            let registered = self
                .for_each_subject(|i| self.register_brain(i, k, &brains[i], &averaged))
                .await?;
            current = collect(&registered, "registered")?;
            transforms = collect(&registered, "transform")?;
            template = Some(averaged);
            iterations = k;
        }

        let template = template.ok_or_else(|| {
            PipelineError::Input("brain_iterations must be at least 1".to_string())
        })?;
        Ok(BrainPhase {
            masks,
            template,
            transforms,
            iterations,
        })
    }
}
