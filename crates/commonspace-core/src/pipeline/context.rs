//! Per-run state and the cache-aware stage executor.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{RegistrationBackend, ToolError};
use crate::cache::{ArtifactFile, CacheLookup, CachedArtifact, NullCache, PersistentCache, StageCache};
use crate::cas::Digest;
use crate::config::EngineSettings;
use crate::error::{PipelineError, Result};
use crate::fingerprint::{FingerprintInput, StageFingerprint, ENGINE_VERSION};
use crate::job::RegistrationJob;
use crate::metrics::RunMetrics;
use crate::obs;
use crate::stage::{OutputLayout, Stage};

/// One stage execution as the executor sees it.
pub(crate) struct StageSpec {
    pub stage: Stage,
    pub iteration: Option<u32>,
    pub subject: Option<usize>,
    /// Content digests of the inputs, in the order the stage consumes them.
    pub inputs: Vec<Digest>,
    pub params: Value,
    /// `(role, path relative to the output dir)` for every file the stage writes.
    pub outputs: Vec<(&'static str, PathBuf)>,
}

/// Everything one run needs. Built at the start of a run and dropped with it.
pub(crate) struct RunContext<'a> {
    pub job: &'a RegistrationJob,
    pub settings: &'a EngineSettings,
    pub backend: &'a dyn RegistrationBackend,
    pub layout: OutputLayout,
    pub metrics: RunMetrics,
    cache: Arc<dyn StageCache>,
    parallel: usize,
}

impl<'a> RunContext<'a> {
    pub fn new(
        job: &'a RegistrationJob,
        settings: &'a EngineSettings,
        backend: &'a dyn RegistrationBackend,
    ) -> Result<Self> {
        let cache: Arc<dyn StageCache> = if job.caching {
            Arc::new(PersistentCache::open(
                &job.output_dir,
                settings.lock_timeout(),
                settings.stale_lock(),
            )?)
        } else {
            Arc::new(NullCache)
        };
        debug!(persistent = cache.is_persistent(), "stage cache selected");

        Ok(Self {
            job,
            settings,
            backend,
            layout: OutputLayout::new(&job.output_dir),
            metrics: RunMetrics::new(),
            cache,
            parallel: settings.parallelism(),
        })
    }

    /// Absolute path of an artifact file.
    pub fn path_of(&self, file: &ArtifactFile) -> PathBuf {
        self.layout.abs(&file.path)
    }

    /// Run `f` for every subject, at most `parallel` at a time. Results keep input order.
    pub async fn for_each_subject<T, F, Fut>(&self, f: F) -> Result<Vec<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        stream::iter(0..self.job.images.len())
            .map(f)
            .buffered(self.parallel)
            .try_collect()
            .await
    }

    /// Answer `spec` from the cache, or await `compute` and record what it wrote.
    ///
    /// `compute` is only polled on a miss, with the fingerprint's cache lock
    /// held until the result is stored. Any failure comes back as
    /// [`PipelineError::Stage`].
    pub async fn execute<Fut>(&self, spec: StageSpec, compute: Fut) -> Result<CachedArtifact>
    where
        Fut: Future<Output = std::result::Result<(), ToolError>>,
    {
        let StageSpec {
            stage,
            iteration,
            subject,
            inputs,
            params,
            outputs,
        } = spec;
        let name = stage.name();

        let fingerprint = StageFingerprint::compute(&FingerprintInput {
            engine_version: ENGINE_VERSION,
            stage: name,
            iteration,
            subject,
            inputs: &inputs,
            params: &params,
        })
        .map_err(|source| PipelineError::Stage {
            stage: name.to_string(),
            subject,
            fingerprint: String::new(),
            source: Box::new(source),
        })?;
        let fail = |source: PipelineError| PipelineError::Stage {
            stage: name.to_string(),
            subject,
            fingerprint: fingerprint.to_hex(),
            source: Box::new(source),
        };

        if let Some(artifact) = self.cached(name, subject, &fingerprint, &outputs) {
            return Ok(artifact);
        }
        // Held until the manifest is persisted, so no other run touches these
        // outputs in between.
        let guard = self.cache.lock(&fingerprint).await.map_err(fail)?;
        if guard.is_some() {
            if let Some(artifact) = self.cached(name, subject, &fingerprint, &outputs) {
                return Ok(artifact);
            }
        }

        let start = Instant::now();
        for (_, rel) in &outputs {
            remove_stale(&self.layout.abs(rel)).map_err(fail)?;
        }
        compute.await.map_err(|e| fail(e.into()))?;

        let mut files = Vec::with_capacity(outputs.len());
        for (role, rel) in outputs {
            let abs = self.layout.abs(&rel);
            let digest = match Digest::of_file(&abs) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(fail(
                        ToolError::MissingOutput {
                            tool: name.to_string(),
                            output: abs,
                        }
                        .into(),
                    ))
                }
                Err(e) => return Err(fail(PipelineError::io(&abs, e))),
            };
            files.push(ArtifactFile {
                role: role.to_string(),
                path: rel,
                digest,
            });
        }

        let artifact = CachedArtifact {
            fingerprint,
            stage: name.to_string(),
            subject,
            files,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.cache.store(&artifact) {
            warn!(
                event = "cache.store_failed",
                stage = %name,
                subject = ?subject,
                fingerprint = %fingerprint.short(),
                error = %e,
                "stage result not cached"
            );
        }

        drop(guard);

        self.metrics.inc_computed();
        obs::emit_stage_computed(name, subject, &fingerprint, start.elapsed().as_millis() as u64);
        Ok(artifact)
    }

    /// A usable cached result for `fingerprint`, counting the hit or the recovery.
    fn cached(
        &self,
        name: &str,
        subject: Option<usize>,
        fingerprint: &StageFingerprint,
        outputs: &[(&'static str, PathBuf)],
    ) -> Option<CachedArtifact> {
        match self.cache.lookup(fingerprint) {
            Ok(CacheLookup::Hit(artifact)) if same_outputs(&artifact, outputs) => {
                self.metrics.inc_cache_hits();
                obs::emit_stage_cache_hit(name, subject, fingerprint);
                return Some(artifact);
            }
            Ok(CacheLookup::Hit(_)) => {
                self.metrics.inc_recovered();
                obs::emit_cache_recovered(name, subject, &"cached outputs do not match the output layout");
            }
            Ok(CacheLookup::Discarded { reason }) => {
                self.metrics.inc_recovered();
                obs::emit_cache_recovered(name, subject, &reason);
            }
            Ok(CacheLookup::Miss) => {}
            Err(e) => {
                self.metrics.inc_recovered();
                obs::emit_cache_recovered(name, subject, &e);
            }
        }
        None
    }
}

fn same_outputs(artifact: &CachedArtifact, outputs: &[(&'static str, PathBuf)]) -> bool {
    artifact.files.len() == outputs.len()
        && artifact
            .files
            .iter()
            .zip(outputs)
            .all(|(file, (role, rel))| file.role == *role && file.path == *rel)
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

/// The output of `artifact` playing `role`.
pub(crate) fn output(artifact: &CachedArtifact, role: &str) -> Result<ArtifactFile> {
    artifact.file(role).cloned().ok_or_else(|| {
        PipelineError::CacheCorruption(format!(
            "{} result {} has no {role} output",
            artifact.stage,
            artifact.fingerprint.short()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeBackend;
    use serde_json::json;

    fn job(dir: &Path, caching: bool) -> RegistrationJob {
        let image = dir.join("anat.nii.gz");
        std::fs::write(&image, b"anat").unwrap();
        RegistrationJob::new(vec![image], dir.join("out"), 400.0).with_caching(caching)
    }

    fn spec(out: &str) -> StageSpec {
        StageSpec {
            stage: Stage::HeadMask,
            iteration: None,
            subject: Some(0),
            inputs: vec![Digest::compute(b"mask")],
            params: json!({ "scalp_dilation": 4 }),
            outputs: vec![("head_mask", PathBuf::from(out))],
        }
    }

    async fn write(path: PathBuf) -> std::result::Result<(), ToolError> {
        std::fs::write(path, b"computed").unwrap();
        Ok(())
    }

    async fn must_not_run() -> std::result::Result<(), ToolError> {
        panic!("stage recomputed despite a cache hit")
    }

    #[tokio::test]
    async fn test_execute_computes_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), true);
        std::fs::create_dir_all(&job.output_dir).unwrap();
        let settings = EngineSettings::default();
        let backend = FakeBackend::new();
        let ctx = RunContext::new(&job, &settings, &backend).unwrap();

        let target = job.output_dir.join("m.nii.gz");
        let first = ctx.execute(spec("m.nii.gz"), write(target.clone())).await.unwrap();
        let second = ctx.execute(spec("m.nii.gz"), must_not_run()).await.unwrap();

        assert_eq!(first, second);
        let stats = ctx.metrics.snapshot();
        assert_eq!((stats.computed, stats.cached), (1, 1));
    }

    #[tokio::test]
    async fn test_execute_reports_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), false);
        std::fs::create_dir_all(&job.output_dir).unwrap();
        let settings = EngineSettings::default();
        let backend = FakeBackend::new();
        let ctx = RunContext::new(&job, &settings, &backend).unwrap();

        let err = ctx
            .execute(spec("never.nii.gz"), async { Ok::<(), ToolError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            PipelineError::ExternalTool(ToolError::MissingOutput { .. })
        ));
        assert_eq!(err.subject(), Some(0));
    }

    #[tokio::test]
    async fn test_for_each_subject_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), false);
        job.images = (0..5).map(|i| dir.path().join(format!("{i}.nii"))).collect();
        let settings = EngineSettings {
            max_parallel: 2,
            ..EngineSettings::default()
        };
        let backend = FakeBackend::new();
        let ctx = RunContext::new(&job, &settings, &backend).unwrap();

        let got = ctx
            .for_each_subject(|i| async move {
                tokio::time::sleep(std::time::Duration::from_millis(10 * (5 - i as u64))).await;
                Ok(i)
            })
            .await
            .unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }
}
