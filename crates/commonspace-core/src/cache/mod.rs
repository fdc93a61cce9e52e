//! Stage-result caching.
//!
//! A [`StageCache`] maps a [`StageFingerprint`] to the [`CachedArtifact`]
//! that stage produced. Two strategies exist and one is picked per run:
//! [`NullCache`] when caching is off, [`PersistentCache`] when it is on.
//! Stage logic only ever talks to the trait.

pub mod lock;
pub mod null;
pub mod persistent;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cas::Digest;
use crate::error::Result;
use crate::fingerprint::StageFingerprint;

pub use lock::LockGuard;
pub use null::NullCache;
pub use persistent::PersistentCache;

/// Directory under the output dir that holds the persistent cache.
pub const CACHE_DIR_NAME: &str = ".commonspace_cache";

/// One output file of a stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// What the file is to the stage, e.g. `"brain_mask"` or `"transform"`.
    pub role: String,
    /// Path relative to the run's output directory.
    pub path: PathBuf,
    pub digest: Digest,
}

/// Manifest of one stage execution. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub fingerprint: StageFingerprint,
    pub stage: String,
    pub subject: Option<usize>,
    pub files: Vec<ArtifactFile>,
    pub created_at: DateTime<Utc>,
}

impl CachedArtifact {
    /// Look up an output by role.
    pub fn file(&self, role: &str) -> Option<&ArtifactFile> {
        self.files.iter().find(|f| f.role == role)
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Entry found and every output file is in place with the recorded digest.
    Hit(CachedArtifact),
    /// No entry for this fingerprint.
    Miss,
    /// An entry existed but was unusable; it has been dropped. Treated as a miss.
    Discarded { reason: String },
}

/// Store of stage results keyed by fingerprint.
///
/// Writers of one fingerprint take [`StageCache::lock`] before touching the
/// stage's outputs and hold it until [`StageCache::store`] returns.
#[async_trait]
pub trait StageCache: Send + Sync {
    /// Find the artifact for `fingerprint`, putting its files back in place if needed.
    fn lookup(&self, fingerprint: &StageFingerprint) -> Result<CacheLookup>;

    /// Exclusive right to compute and store `fingerprint`, shared with every
    /// other run on the same output directory. `None` when nothing is shared.
    async fn lock(&self, fingerprint: &StageFingerprint) -> Result<Option<LockGuard>>;

    /// Persist `artifact`. The caller holds the lock for its fingerprint.
    fn store(&self, artifact: &CachedArtifact) -> Result<()>;

    /// Whether anything outlives the run.
    fn is_persistent(&self) -> bool;
}
