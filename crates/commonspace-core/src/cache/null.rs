use async_trait::async_trait;

use super::{CacheLookup, CachedArtifact, LockGuard, StageCache};
use crate::error::Result;
use crate::fingerprint::StageFingerprint;

/// Cache used when caching is disabled: every lookup misses, nothing is kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

#[async_trait]
impl StageCache for NullCache {
    fn lookup(&self, _fingerprint: &StageFingerprint) -> Result<CacheLookup> {
        Ok(CacheLookup::Miss)
    }

    async fn lock(&self, _fingerprint: &StageFingerprint) -> Result<Option<LockGuard>> {
        Ok(None)
    }

    fn store(&self, _artifact: &CachedArtifact) -> Result<()> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::Digest;
    use crate::fingerprint::{FingerprintInput, ENGINE_VERSION};

    #[tokio::test]
    async fn null_cache_never_hits() {
        let params = serde_json::json!({});
        let fingerprint = StageFingerprint::compute(&FingerprintInput {
            engine_version: ENGINE_VERSION,
            stage: "brain_average",
            iteration: None,
            subject: None,
            inputs: &[Digest::compute(b"x")],
            params: &params,
        })
        .unwrap();
        let artifact = CachedArtifact {
            fingerprint,
            stage: "brain_average".to_string(),
            subject: None,
            files: vec![],
            created_at: chrono::Utc::now(),
        };

        let cache = NullCache;
        assert!(cache.lock(&fingerprint).await.unwrap().is_none());
        cache.store(&artifact).unwrap();
        assert_eq!(cache.lookup(&fingerprint).unwrap(), CacheLookup::Miss);
        assert!(!cache.is_persistent());
    }
}
