//! Pipeline stages and the file names they write.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const IMAGE_EXT: &str = ".nii.gz";
pub const TRANSFORM_EXT: &str = ".aff12.1D";

/// Every stage of the register-to-common-space pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Skull-strip each scan (brain + mask).
    BrainExtraction,
    /// Mean of the current brains: the running template.
    BrainAverage,
    /// Affine registration of each extracted brain to the running template.
    BrainAffine,
    /// Brain mask dilated to include a rim of scalp.
    HeadMask,
    /// Whole head and head mask resampled through the brain transform.
    HeadInit,
    /// Mean of initialized heads (template) and of their masks (cost weight).
    HeadAverage,
    /// Mask-weighted affine registration of each head to the head template.
    HeadAffine,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::BrainExtraction,
        Stage::BrainAverage,
        Stage::BrainAffine,
        Stage::HeadMask,
        Stage::HeadInit,
        Stage::HeadAverage,
        Stage::HeadAffine,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::BrainExtraction => "brain_extraction",
            Stage::BrainAverage => "brain_average",
            Stage::BrainAffine => "brain_affine",
            Stage::HeadMask => "head_mask",
            Stage::HeadInit => "head_init",
            Stage::HeadAverage => "head_average",
            Stage::HeadAffine => "head_affine",
        }
    }

    /// Whether the stage runs once per subject (vs once per batch).
    pub fn per_subject(&self) -> bool {
        !matches!(self, Stage::BrainAverage | Stage::HeadAverage)
    }

}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deterministic names for everything written under the output directory.
///
/// Paths returned by the `*_file` methods are relative to the output dir;
/// [`OutputLayout::abs`] resolves them.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abs(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    fn stem(stage: Stage, iteration: Option<u32>, role: &str) -> String {
        match iteration {
            Some(k) => format!("{}_iter{k}_{role}", stage.name()),
            None => format!("{}_{role}", stage.name()),
        }
    }

    pub fn subject_file(&self, subject: usize, stage: Stage, iteration: Option<u32>, role: &str, ext: &str) -> PathBuf {
        PathBuf::from(format!("anat_{subject:03}_{}{ext}", Self::stem(stage, iteration, role)))
    }

    pub fn global_file(&self, stage: Stage, iteration: Option<u32>, role: &str, ext: &str) -> PathBuf {
        PathBuf::from(format!("{}{ext}", Self::stem(stage, iteration, role)))
    }

    /// Final registered image of a subject.
    pub fn registered(&self, subject: usize) -> PathBuf {
        PathBuf::from(format!("anat_{subject:03}_registered{IMAGE_EXT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_unique() {
        let mut names: Vec<_> = Stage::ALL.iter().map(Stage::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Stage::ALL.len());
    }

    #[test]
    fn test_layout_names() {
        let layout = OutputLayout::new("/out");
        assert_eq!(
            layout.subject_file(2, Stage::BrainAffine, Some(3), "transform", TRANSFORM_EXT),
            PathBuf::from("anat_002_brain_affine_iter3_transform.aff12.1D")
        );
        assert_eq!(
            layout.global_file(Stage::HeadAverage, None, "weight", IMAGE_EXT),
            PathBuf::from("head_average_weight.nii.gz")
        );
        assert_eq!(
            layout.abs(&layout.registered(0)),
            PathBuf::from("/out/anat_000_registered.nii.gz")
        );
    }

    #[test]
    fn test_stage_shape() {
        assert!(Stage::BrainExtraction.per_subject());
        assert!(!Stage::HeadAverage.per_subject());
    }
}
