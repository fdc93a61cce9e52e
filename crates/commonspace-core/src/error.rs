//! Error taxonomy for the registration pipeline.

use std::path::{Path, PathBuf};

use crate::backend::ToolError;
use crate::cas::CasError;

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool error: {0}")]
    ExternalTool(#[from] ToolError),

    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stage {stage}{} failed (fingerprint {fingerprint}): {source}", subject_suffix(.subject))]
    Stage {
        stage: String,
        subject: Option<usize>,
        fingerprint: String,
        #[source]
        source: Box<PipelineError>,
    },
}

fn subject_suffix(subject: &Option<usize>) -> String {
    subject.map(|i| format!(" for subject {i}")).unwrap_or_default()
}

impl PipelineError {
    /// Attach a path to an io error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// The innermost error, skipping `Stage` wrappers.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            Self::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Subject index of the failing stage, if the failure was per subject.
    pub fn subject(&self) -> Option<usize> {
        match self {
            Self::Stage { subject, .. } => *subject,
            _ => None,
        }
    }
}

impl From<CasError> for PipelineError {
    fn from(err: CasError) -> Self {
        match err {
            CasError::Io(e) => Self::Io {
                path: PathBuf::new(),
                source: e,
            },
            other => Self::CacheCorruption(other.to_string()),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_names_stage_subject_and_fingerprint() {
        let err = PipelineError::Stage {
            stage: "brain_affine".to_string(),
            subject: Some(2),
            fingerprint: "abc123".to_string(),
            source: Box::new(PipelineError::Input("bad".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("brain_affine"));
        assert!(msg.contains("subject 2"));
        assert!(msg.contains("abc123"));
        assert_eq!(err.subject(), Some(2));
        assert!(matches!(err.root_cause(), PipelineError::Input(_)));
    }

    #[test]
    fn test_global_stage_error_has_no_subject() {
        let err = PipelineError::Stage {
            stage: "brain_average".to_string(),
            subject: None,
            fingerprint: "def456".to_string(),
            source: Box::new(PipelineError::CacheCorruption("x".to_string())),
        };
        assert!(!err.to_string().contains("subject"));
        assert_eq!(err.subject(), None);
    }

    #[test]
    fn test_cas_not_found_maps_to_cache_corruption() {
        let err: PipelineError = CasError::NotFound(crate::cas::Digest::compute(b"x")).into();
        assert!(matches!(err, PipelineError::CacheCorruption(_)));
    }
}
