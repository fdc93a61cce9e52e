//! Stage C: whole-head registration weighted by a dilated brain mask.

use serde_json::json;

use super::brain::BrainPhase;
use super::context::{output, RunContext, StageSpec};
use crate::backend::{AffineRegistration, ApplyTransform, Interpolation};
use crate::cache::{ArtifactFile, CachedArtifact};
use crate::cas::Digest;
use crate::error::{PipelineError, Result};
use crate::stage::{Stage, IMAGE_EXT, TRANSFORM_EXT};

#[derive(Debug, Clone)]
pub(crate) struct HeadPhase {
    pub template: ArtifactFile,
    pub registered: Vec<ArtifactFile>,
    pub transforms: Vec<ArtifactFile>,
}

struct InitializedHead {
    head: ArtifactFile,
    mask: ArtifactFile,
}

impl RunContext<'_> {
    async fn head_mask(&self, subject: usize, brain_mask: &ArtifactFile) -> Result<CachedArtifact> {
        let voxels = self.settings.scalp_dilation;
        let out = self
            .layout
            .subject_file(subject, Stage::HeadMask, None, "head_mask", IMAGE_EXT);
        let spec = StageSpec {
            stage: Stage::HeadMask,
            iteration: None,
            subject: Some(subject),
            inputs: vec![brain_mask.digest],
            params: json!({ "scalp_dilation": voxels }),
            outputs: vec![("head_mask", out.clone())],
        };
        let mask = self.path_of(brain_mask);
        let out = self.layout.abs(&out);
        self.execute(spec, async move {
            self.backend.dilate_mask(&mask, voxels, &out).await
        })
        .await
    }

    /// Bring the whole head and its mask into brain-template space.
    async fn head_init(
        &self,
        subject: usize,
        image: Digest,
        transform: &ArtifactFile,
        head_mask: &ArtifactFile,
        brain_template: &ArtifactFile,
    ) -> Result<CachedArtifact> {
        let head = self
            .layout
            .subject_file(subject, Stage::HeadInit, None, "head", IMAGE_EXT);
        let mask = self
            .layout
            .subject_file(subject, Stage::HeadInit, None, "head_mask", IMAGE_EXT);
        let spec = StageSpec {
            stage: Stage::HeadInit,
            iteration: None,
            subject: Some(subject),
            inputs: vec![image, transform.digest, head_mask.digest, brain_template.digest],
            params: json!({ "resolution": self.job.resolution }),
            outputs: vec![("head", head.clone()), ("head_mask", mask.clone())],
        };

        let image = &self.job.images[subject];
        let transform = self.path_of(transform);
        let mask_in = self.path_of(head_mask);
        let reference = self.path_of(brain_template);
        let (head, mask) = (self.layout.abs(&head), self.layout.abs(&mask));
        self.execute(spec, async move {
            self.backend
                .apply_transform(&ApplyTransform {
                    moving: image,
                    transform: &transform,
                    reference: &reference,
                    output: &head,
                    interpolation: Interpolation::Linear,
                })
                .await?;
            self.backend
                .apply_transform(&ApplyTransform {
                    moving: &mask_in,
                    transform: &transform,
                    reference: &reference,
                    output: &mask,
                    interpolation: Interpolation::NearestNeighbour,
                })
                .await
        })
        .await
    }

    async fn head_average(&self, heads: &[InitializedHead]) -> Result<CachedArtifact> {
        let template = self
            .layout
            .global_file(Stage::HeadAverage, None, "template", IMAGE_EXT);
        let weight = self
            .layout
            .global_file(Stage::HeadAverage, None, "weight", IMAGE_EXT);
        let spec = StageSpec {
            stage: Stage::HeadAverage,
            iteration: None,
            subject: None,
            inputs: heads
                .iter()
                .map(|h| h.head.digest)
                .chain(heads.iter().map(|h| h.mask.digest))
                .collect(),
            params: json!({ "resolution": self.job.resolution }),
            outputs: vec![("template", template.clone()), ("weight", weight.clone())],
        };

        let head_paths: Vec<_> = heads.iter().map(|h| self.path_of(&h.head)).collect();
        let mask_paths: Vec<_> = heads.iter().map(|h| self.path_of(&h.mask)).collect();
        let (template, weight) = (self.layout.abs(&template), self.layout.abs(&weight));
        self.execute(spec, async move {
            self.backend.average(&head_paths, &template).await?;
            self.backend.average(&mask_paths, &weight).await
        })
        .await
    }

    async fn head_affine(
        &self,
        subject: usize,
        head: &ArtifactFile,
        template: &ArtifactFile,
        weight: &ArtifactFile,
        brain_transform: &ArtifactFile,
    ) -> Result<CachedArtifact> {
        let resolution = self.job.resolution;
        let registered = self.layout.registered(subject);
        let transform = self
            .layout
            .subject_file(subject, Stage::HeadAffine, None, "transform", TRANSFORM_EXT);
        let spec = StageSpec {
            stage: Stage::HeadAffine,
            iteration: None,
            subject: Some(subject),
            inputs: vec![head.digest, template.digest, weight.digest, brain_transform.digest],
            params: json!({ "resolution": resolution }),
            outputs: vec![("registered", registered.clone()), ("transform", transform.clone())],
        };

        let (moving, reference, weight) = (
            self.path_of(head),
            self.path_of(template),
            self.path_of(weight),
        );
        let (registered, transform) = (self.layout.abs(&registered), self.layout.abs(&transform));
        self.execute(spec, async move {
            self.backend
                .affine_register(&AffineRegistration {
                    moving: &moving,
                    reference: &reference,
                    output: &registered,
                    transform_out: &transform,
                    weight: Some(&weight),
                    resolution,
                })
                .await
        })
        .await
    }

    pub(crate) async fn head_phase(&self, images: &[Digest], brain: &BrainPhase) -> Result<HeadPhase> {
        let masks = self
            .for_each_subject(|i| async move {
                let artifact = self.head_mask(i, &brain.masks[i]).await?;
                output(&artifact, "head_mask")
            })
            .await?;

        let heads = self
            .for_each_subject(|i| {
                let mask = &masks[i];
                async move {
                    let artifact = self
                        .head_init(i, images[i], &brain.transforms[i], mask, &brain.template)
                        .await?;
                    Ok::<_, PipelineError>(InitializedHead {
                        head: output(&artifact, "head")?,
                        mask: output(&artifact, "head_mask")?,
                    })
                }
            })
            .await?;

        let averaged = self.head_average(&heads).await?;
        let template = output(&averaged, "template")?;
        let weight = output(&averaged, "weight")?;

        let registered = self
            .for_each_subject(|i| {
                self.head_affine(i, &heads[i].head, &template, &weight, &brain.transforms[i])
            })
            .await?;

        Ok(HeadPhase {
            template,
            registered: registered
                .iter()
                .map(|a| output(a, "registered"))
                .collect::<Result<_>>()?,
            transforms: registered
                .iter()
                .map(|a| output(a, "transform"))
                .collect::<Result<_>>()?,
        })
    }
}
