//! Registration job description and up-front validation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::backend::ExtractionMethod;
use crate::error::{PipelineError, Result};

/// File name suffixes accepted as anatomical images.
pub const IMAGE_EXTENSIONS: &[&str] = &[".nii", ".nii.gz", ".hdr", ".img", ".mnc"];

/// One pipeline invocation. Not modified once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationJob {
    /// Anatomical scans, in the order results are reported.
    pub images: Vec<PathBuf>,
    /// Where intermediate and final images (and the cache) are written.
    pub output_dir: PathBuf,
    /// Positive resolution parameter, forwarded to every stage.
    pub resolution: f64,
    /// RATS brain extraction instead of histogram-based skull stripping.
    /// Off unless asked for.
    pub use_rats_tool: bool,
    /// Memoize stage outputs under `output_dir`.
    pub caching: bool,
}

impl RegistrationJob {
    pub fn new(images: Vec<PathBuf>, output_dir: impl Into<PathBuf>, resolution: f64) -> Self {
        Self {
            images,
            output_dir: output_dir.into(),
            resolution,
            use_rats_tool: false,
            caching: false,
        }
    }

    pub fn with_rats_tool(mut self, use_rats_tool: bool) -> Self {
        self.use_rats_tool = use_rats_tool;
        self
    }

    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    pub fn extraction_method(&self) -> ExtractionMethod {
        ExtractionMethod::from_use_rats_tool(self.use_rats_tool)
    }

    /// Check the inputs without touching the filesystem for writing.
    pub fn validate(&self) -> Result<()> {
        if self.images.is_empty() {
            return Err(PipelineError::Input("no input images given".to_string()));
        }
        if !self.resolution.is_finite() || self.resolution <= 0.0 {
            return Err(PipelineError::Input(format!(
                "resolution must be a positive number, got {}",
                self.resolution
            )));
        }
        for (i, image) in self.images.iter().enumerate() {
            check_image(i, image)?;
        }
        Ok(())
    }
}

fn has_image_extension(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    IMAGE_EXTENSIONS
        .iter()
        .any(|ext| name.len() > ext.len() && name.ends_with(ext))
}

fn check_image(subject: usize, path: &Path) -> Result<()> {
    if !has_image_extension(path) {
        return Err(PipelineError::Input(format!(
            "subject {subject}: {} is not a recognised image file (expected one of {})",
            path.display(),
            IMAGE_EXTENSIONS.join(", ")
        )));
    }
    let meta = fs::metadata(path).map_err(|e| {
        PipelineError::Input(format!("subject {subject}: cannot access {}: {e}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(PipelineError::Input(format!(
            "subject {subject}: {} is not a regular file",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(PipelineError::Input(format!(
            "subject {subject}: {} is empty",
            path.display()
        )));
    }
    fs::File::open(path).map_err(|e| {
        PipelineError::Input(format!("subject {subject}: cannot read {}: {e}", path.display()))
    })?;
    Ok(())
}

/// Create `output_dir` if needed and prove it is writable.
pub fn prepare_output_dir(output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir).map_err(|e| PipelineError::io(output_dir, e))?;
    NamedTempFile::new_in(output_dir).map_err(|e| PipelineError::io(output_dir, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"nifti").unwrap();
        path
    }

    #[test]
    fn test_new_job_uses_histogram_extraction_without_cache() {
        let job = RegistrationJob::new(vec![], "/tmp/out", 400.0);
        assert!(!job.use_rats_tool);
        assert!(!job.caching);
        assert_eq!(job.extraction_method(), ExtractionMethod::Histogram);

        let job = job.with_rats_tool(true).with_caching(true);
        assert!(job.caching);
        assert_eq!(job.extraction_method(), ExtractionMethod::Rats);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let job = RegistrationJob::new(vec![], "/tmp/out", 400.0);
        assert!(matches!(job.validate(), Err(PipelineError::Input(_))));
    }

    #[test]
    fn test_non_positive_resolution_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![image(dir.path(), "a.nii.gz")];
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let job = RegistrationJob::new(images.clone(), dir.path(), bad);
            assert!(matches!(job.validate(), Err(PipelineError::Input(_))), "{bad}");
        }
    }

    #[test]
    fn test_extension_check() {
        assert!(has_image_extension(Path::new("/data/anat.nii.gz")));
        assert!(has_image_extension(Path::new("ANAT.NII")));
        assert!(!has_image_extension(Path::new("anat.txt")));
        assert!(!has_image_extension(Path::new(".nii")));
    }

    #[test]
    fn test_error_names_offending_subject() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![
            image(dir.path(), "a.nii.gz"),
            dir.path().join("missing.nii.gz"),
        ];
        let err = RegistrationJob::new(images, dir.path(), 400.0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("subject 1"));
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.nii");
        fs::write(&empty, b"").unwrap();
        let err = RegistrationJob::new(vec![empty], dir.path(), 400.0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_prepare_output_dir_creates_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a").join("b");
        prepare_output_dir(&out).unwrap();
        assert!(out.is_dir());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_prepare_output_dir_under_file_fails_with_io() {
        let dir = tempfile::tempdir().unwrap();
        let file = image(dir.path(), "blocker.nii");
        let err = prepare_output_dir(&file.join("out")).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }
}
