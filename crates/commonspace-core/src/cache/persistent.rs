use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::lock::LockGuard;
use super::{CacheLookup, CachedArtifact, StageCache, CACHE_DIR_NAME};
use crate::cas::fs::FsBlobStore;
use crate::cas::{BlobStore, CasError, Digest};
use crate::error::{PipelineError, Result};
use crate::fingerprint::StageFingerprint;

/// On-disk stage cache living inside the run's output directory.
///
/// Layout under `<output_dir>/.commonspace_cache/`:
/// - `entries/<2 hex>/<62 hex>.json`: manifest per fingerprint
/// - `objects/<2 hex>/<62 hex>`: content-addressed copies of every output file
///
/// Output files referenced by a manifest are checked against their digests on
/// lookup and restored from `objects/` when missing or modified.
pub struct PersistentCache {
    output_dir: PathBuf,
    root: PathBuf,
    blobs: FsBlobStore,
    lock_timeout: Duration,
    stale_lock: Duration,
}

impl PersistentCache {
    /// Open (creating if needed) the cache for `output_dir`.
    pub fn open(output_dir: impl AsRef<Path>, lock_timeout: Duration, stale_lock: Duration) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        let root = Self::root_for(&output_dir);
        let entries = root.join("entries");
        fs::create_dir_all(&entries).map_err(|e| PipelineError::io(&entries, e))?;
        let blobs = FsBlobStore::new(&root).map_err(|e| cas_io(&root, e))?;
        Ok(Self {
            output_dir,
            root,
            blobs,
            lock_timeout,
            stale_lock,
        })
    }

    /// Where the cache for `output_dir` lives.
    pub fn root_for(output_dir: &Path) -> PathBuf {
        output_dir.join(CACHE_DIR_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, fingerprint: &StageFingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root
            .join("entries")
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }

    /// Number of manifests currently stored.
    pub fn entry_count(&self) -> Result<usize> {
        count_entries(&self.root.join("entries"))
    }

    /// Delete every entry and blob. Output files are left alone.
    pub fn clear(self) -> Result<usize> {
        let count = self.entry_count()?;
        fs::remove_dir_all(&self.root).map_err(|e| PipelineError::io(&self.root, e))?;
        Ok(count)
    }

    fn read_manifest(&self, path: &Path, fingerprint: &StageFingerprint) -> std::result::Result<Option<CachedArtifact>, String> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("unreadable manifest: {e}")),
        };
        let artifact: CachedArtifact =
            serde_json::from_slice(&bytes).map_err(|e| format!("malformed manifest: {e}"))?;
        if artifact.fingerprint != *fingerprint {
            return Err(format!(
                "manifest records fingerprint {} under key {}",
                artifact.fingerprint.short(),
                fingerprint.short()
            ));
        }
        Ok(Some(artifact))
    }

    /// Make sure every output of `artifact` is on disk with the recorded digest.
    fn materialize(&self, artifact: &CachedArtifact) -> Result<std::result::Result<(), String>> {
        for file in &artifact.files {
            if file.path.is_absolute() || file.path.components().any(|c| c == std::path::Component::ParentDir) {
                return Ok(Err(format!("output path {} escapes output dir", file.path.display())));
            }
            let dest = self.output_dir.join(&file.path);
            if matches!(Digest::of_file(&dest), Ok(d) if d == file.digest) {
                continue;
            }
            debug!(path = %dest.display(), digest = %file.digest.short(), "restoring output from cache");
            match self.blobs.restore(&file.digest, &dest) {
                Ok(()) => {}
                Err(CasError::Io(e)) => return Err(PipelineError::io(&dest, e)),
                Err(other) => return Ok(Err(format!("{} ({}): {other}", file.role, file.path.display()))),
            }
        }
        Ok(Ok(()))
    }

    fn discard(&self, path: &Path, fingerprint: &StageFingerprint, reason: String) -> CacheLookup {
        warn!(
            event = "cache.discarded",
            fingerprint = %fingerprint.short(),
            reason = %reason,
            "dropping unusable cache entry"
        );
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "could not remove cache entry");
            }
        }
        CacheLookup::Discarded { reason }
    }
}

#[async_trait]
impl StageCache for PersistentCache {
    fn lookup(&self, fingerprint: &StageFingerprint) -> Result<CacheLookup> {
        let path = self.entry_path(fingerprint);
        let artifact = match self.read_manifest(&path, fingerprint) {
            Ok(Some(a)) => a,
            Ok(None) => return Ok(CacheLookup::Miss),
            Err(reason) => return Ok(self.discard(&path, fingerprint, reason)),
        };
        match self.materialize(&artifact)? {
            Ok(()) => Ok(CacheLookup::Hit(artifact)),
            Err(reason) => Ok(self.discard(&path, fingerprint, reason)),
        }
    }

    async fn lock(&self, fingerprint: &StageFingerprint) -> Result<Option<LockGuard>> {
        let path = self.entry_path(fingerprint).with_extension("lock");
        let guard = LockGuard::acquire(&path, self.lock_timeout, self.stale_lock)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;
        Ok(Some(guard))
    }

    fn store(&self, artifact: &CachedArtifact) -> Result<()> {
        let path = self.entry_path(&artifact.fingerprint);

        if let Ok(Some(existing)) = self.read_manifest(&path, &artifact.fingerprint) {
            debug!(fingerprint = %artifact.fingerprint.short(), stage = %existing.stage, "entry already stored");
            return Ok(());
        }

        for file in &artifact.files {
            let src = self.output_dir.join(&file.path);
            let digest = self.blobs.put_file(&src).map_err(|e| cas_io(&src, e))?;
            if digest != file.digest {
                return Err(PipelineError::CacheCorruption(format!(
                    "{} changed while being cached (expected {}, found {})",
                    src.display(),
                    file.digest.short(),
                    digest.short()
                )));
            }
        }

        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| PipelineError::io(parent, e))?;
        serde_json::to_writer_pretty(&mut tmp, artifact)?;
        tmp.flush().map_err(|e| PipelineError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| PipelineError::io(&path, e.error))?;

        debug!(fingerprint = %artifact.fingerprint.short(), stage = %artifact.stage, "cache entry stored");
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Count manifests under an `entries/` directory without opening the cache.
pub fn count_entries(entries: &Path) -> Result<usize> {
    let shards = match fs::read_dir(entries) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(PipelineError::io(entries, e)),
    };
    let mut count = 0;
    for shard in shards {
        let shard = shard.map_err(|e| PipelineError::io(entries, e))?.path();
        if !shard.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&shard).map_err(|e| PipelineError::io(&shard, e))? {
            let entry = entry.map_err(|e| PipelineError::io(&shard, e))?.path();
            if entry.extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn cas_io(path: &Path, err: CasError) -> PipelineError {
    match err {
        CasError::Io(e) => PipelineError::io(path, e),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArtifactFile;
    use crate::fingerprint::{FingerprintInput, ENGINE_VERSION};
    use std::sync::Arc;

    const LONG: Duration = Duration::from_secs(30);

    fn fingerprint(tag: &str) -> StageFingerprint {
        let params = serde_json::json!({ "tag": tag });
        StageFingerprint::compute(&FingerprintInput {
            engine_version: ENGINE_VERSION,
            stage: "brain_extraction",
            iteration: None,
            subject: Some(0),
            inputs: &[],
            params: &params,
        })
        .unwrap()
    }

    fn write_output(dir: &Path, rel: &str, data: &[u8]) -> ArtifactFile {
        fs::write(dir.join(rel), data).unwrap();
        ArtifactFile {
            role: "brain".to_string(),
            path: PathBuf::from(rel),
            digest: Digest::compute(data),
        }
    }

    fn artifact(fp: StageFingerprint, files: Vec<ArtifactFile>) -> CachedArtifact {
        CachedArtifact {
            fingerprint: fp,
            stage: "brain_extraction".to_string(),
            subject: Some(0),
            files,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn store_then_lookup_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let fp = fingerprint("a");
        let stored = artifact(fp, vec![write_output(dir.path(), "anat_000_brain.nii.gz", b"brain")]);

        assert_eq!(cache.lookup(&fp).unwrap(), CacheLookup::Miss);
        cache.store(&stored).unwrap();
        assert_eq!(cache.lookup(&fp).unwrap(), CacheLookup::Hit(stored));
        assert_eq!(cache.entry_count().unwrap(), 1);
    }

    #[test]
    fn deleted_output_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let fp = fingerprint("restore");
        cache
            .store(&artifact(fp, vec![write_output(dir.path(), "out.nii.gz", b"payload")]))
            .unwrap();

        fs::remove_file(dir.path().join("out.nii.gz")).unwrap();
        assert!(matches!(cache.lookup(&fp).unwrap(), CacheLookup::Hit(_)));
        assert_eq!(fs::read(dir.path().join("out.nii.gz")).unwrap(), b"payload");
    }

    #[test]
    fn edited_output_is_overwritten_with_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let fp = fingerprint("edit");
        cache
            .store(&artifact(fp, vec![write_output(dir.path(), "out.nii.gz", b"original")]))
            .unwrap();

        fs::write(dir.path().join("out.nii.gz"), b"edited by hand").unwrap();
        assert!(matches!(cache.lookup(&fp).unwrap(), CacheLookup::Hit(_)));
        assert_eq!(fs::read(dir.path().join("out.nii.gz")).unwrap(), b"original");
    }

    #[test]
    fn malformed_manifest_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let fp = fingerprint("bad");
        let path = cache.entry_path(&fp);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(cache.lookup(&fp).unwrap(), CacheLookup::Discarded { .. }));
        assert!(!path.exists());
        assert_eq!(cache.lookup(&fp).unwrap(), CacheLookup::Miss);
    }

    #[test]
    fn fingerprint_collision_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let real = fingerprint("real");
        let other = fingerprint("other");

        let manifest = serde_json::to_vec(&artifact(other, vec![])).unwrap();
        let path = cache.entry_path(&real);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, manifest).unwrap();

        match cache.lookup(&real).unwrap() {
            CacheLookup::Discarded { reason } => assert!(reason.contains("fingerprint")),
            other => panic!("expected Discarded, got {other:?}"),
        }
    }

    #[test]
    fn missing_blob_and_output_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let fp = fingerprint("gone");
        cache
            .store(&artifact(fp, vec![write_output(dir.path(), "out.nii.gz", b"data")]))
            .unwrap();

        fs::remove_file(dir.path().join("out.nii.gz")).unwrap();
        fs::remove_dir_all(cache.root().join("objects")).unwrap();
        fs::create_dir_all(cache.root().join("objects")).unwrap();

        assert!(matches!(cache.lookup(&fp).unwrap(), CacheLookup::Discarded { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn locked_writers_leave_one_manifest_and_no_lock() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PersistentCache::open(dir.path(), LONG, LONG).unwrap());
        let fp = fingerprint("race");
        let stored = artifact(fp, vec![write_output(dir.path(), "out.nii.gz", b"shared")]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let stored = stored.clone();
                tokio::spawn(async move {
                    let _guard = cache.lock(&fp).await.unwrap();
                    cache.store(&stored).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(cache.entry_count().unwrap(), 1);
        assert!(!cache.entry_path(&fp).with_extension("lock").exists());
        assert_eq!(cache.lookup(&fp).unwrap(), CacheLookup::Hit(stored));
    }

    #[tokio::test]
    async fn second_writer_waits_and_then_sees_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PersistentCache::open(dir.path(), LONG, LONG).unwrap());
        let fp = fingerprint("wait");
        let first = cache.lock(&fp).await.unwrap();
        assert!(first.is_some());

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let _guard = cache.lock(&fp).await.unwrap();
                cache.lookup(&fp).unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        let stored = artifact(fp, vec![write_output(dir.path(), "out.nii.gz", b"first")]);
        cache.store(&stored).unwrap();
        drop(first);

        assert_eq!(waiter.await.unwrap(), CacheLookup::Hit(stored));
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open(dir.path(), LONG, LONG).unwrap();
        let fp = fingerprint("clear");
        cache
            .store(&artifact(fp, vec![write_output(dir.path(), "out.nii.gz", b"x")]))
            .unwrap();

        let root = cache.root().to_path_buf();
        assert_eq!(cache.clear().unwrap(), 1);
        assert!(!root.exists());
        assert!(dir.path().join("out.nii.gz").exists());
    }
}
