//! External registration tools.
//!
//! The engine never touches voxels itself. Every image operation goes through
//! a [`RegistrationBackend`], which reads input files and writes output files.
//! [`CommandBackend`] shells out to AFNI/RATS programs; tests use
//! [`crate::fakes::FakeBackend`].

pub mod command;
pub mod runner;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use command::{CommandBackend, ToolCommands};
pub use runner::{ToolOutput, ToolRunner};

/// Errors raised by external tools.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("{tool} is not available: {reason}")]
    Unavailable { tool: String, reason: String },

    #[error("{tool} exited with code {exit_code}: {stderr}")]
    Failed {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout_secs} seconds")]
    TimedOut { tool: String, timeout_secs: u64 },

    #[error("{tool} did not produce {}", .output.display())]
    MissingOutput { tool: String, output: PathBuf },
}

impl ToolError {
    /// Name of the tool that failed.
    pub fn tool(&self) -> &str {
        match self {
            Self::Unavailable { tool, .. }
            | Self::Failed { tool, .. }
            | Self::TimedOut { tool, .. }
            | Self::MissingOutput { tool, .. } => tool,
        }
    }
}

/// How brains are separated from the rest of the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// RATS mathematical-morphology skull stripping.
    Rats,
    /// Intensity-histogram based skull stripping (AFNI).
    Histogram,
}

impl ExtractionMethod {
    pub fn from_use_rats_tool(use_rats_tool: bool) -> Self {
        if use_rats_tool {
            Self::Rats
        } else {
            Self::Histogram
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rats => "rats",
            Self::Histogram => "histogram",
        }
    }
}

/// Interpolation used when resampling through a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Linear,
    /// For masks, so labels stay binary.
    NearestNeighbour,
}

#[derive(Debug, Clone)]
pub struct BrainExtraction<'a> {
    pub input: &'a Path,
    pub brain_out: &'a Path,
    pub mask_out: &'a Path,
    pub method: ExtractionMethod,
    pub resolution: f64,
}

#[derive(Debug, Clone)]
pub struct AffineRegistration<'a> {
    pub moving: &'a Path,
    pub reference: &'a Path,
    pub output: &'a Path,
    pub transform_out: &'a Path,
    /// Cost-function weight in reference space.
    pub weight: Option<&'a Path>,
    pub resolution: f64,
}

#[derive(Debug, Clone)]
pub struct ApplyTransform<'a> {
    pub moving: &'a Path,
    pub transform: &'a Path,
    /// Grid to resample onto.
    pub reference: &'a Path,
    pub output: &'a Path,
    pub interpolation: Interpolation,
}

/// Image operations the pipeline delegates to external tools.
#[async_trait]
pub trait RegistrationBackend: Send + Sync {
    /// Write a skull-stripped brain and its binary mask.
    async fn extract_brain(&self, req: &BrainExtraction<'_>) -> Result<(), ToolError>;

    /// Voxel-wise mean of `inputs`, which must share a grid.
    async fn average(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError>;

    /// Grow a binary mask by `voxels` voxels.
    async fn dilate_mask(&self, mask: &Path, voxels: u32, output: &Path) -> Result<(), ToolError>;

    /// Estimate an affine transform from `moving` to `reference` and write the resampled image.
    async fn affine_register(&self, req: &AffineRegistration<'_>) -> Result<(), ToolError>;

    /// Resample `moving` through an existing transform.
    async fn apply_transform(&self, req: &ApplyTransform<'_>) -> Result<(), ToolError>;
}
