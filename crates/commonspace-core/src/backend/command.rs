//! Backend that drives AFNI and RATS command-line programs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::runner::{find_program, tail, ToolRunner, LOG_TAIL};
use super::{
    AffineRegistration, ApplyTransform, BrainExtraction, ExtractionMethod, Interpolation,
    RegistrationBackend, ToolError,
};

/// Program names (or paths) for every tool the pipeline calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCommands {
    /// RATS mathematical-morphology brain extraction.
    pub rats: String,
    /// Histogram-based skull stripping, used when RATS is not requested.
    pub skull_strip: String,
    /// Voxel-wise expression evaluator, used to apply masks.
    pub calc: String,
    /// Voxel-wise mean of several volumes.
    pub mean: String,
    /// Mask dilation.
    pub mask_tool: String,
    /// Affine registration and resampling.
    pub allineate: String,
    /// Cost function for affine registration.
    pub cost: String,
    /// Per-invocation timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            rats: "RATS_MM".to_string(),
            skull_strip: "3dSkullStrip".to_string(),
            calc: "3dcalc".to_string(),
            mean: "3dMean".to_string(),
            mask_tool: "3dmask_tool".to_string(),
            allineate: "3dAllineate".to_string(),
            cost: "nmi".to_string(),
            timeout_secs: 0,
        }
    }
}

fn arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

impl ToolCommands {
    /// Programs a run with the given extraction method will need.
    pub fn required_programs(&self, method: ExtractionMethod) -> Vec<&str> {
        let extractor = match method {
            ExtractionMethod::Rats => self.rats.as_str(),
            ExtractionMethod::Histogram => self.skull_strip.as_str(),
        };
        vec![
            extractor,
            self.calc.as_str(),
            self.mean.as_str(),
            self.mask_tool.as_str(),
            self.allineate.as_str(),
        ]
    }

    fn mask_argv(&self, req: &BrainExtraction<'_>) -> Vec<String> {
        match req.method {
            ExtractionMethod::Rats => vec![
                self.rats.clone(),
                arg(req.input),
                arg(req.mask_out),
                "-v".to_string(),
                req.resolution.to_string(),
            ],
            ExtractionMethod::Histogram => vec![
                self.skull_strip.clone(),
                "-input".to_string(),
                arg(req.input),
                "-prefix".to_string(),
                arg(req.mask_out),
                "-mask_vol".to_string(),
            ],
        }
    }

    fn apply_mask_argv(&self, req: &BrainExtraction<'_>) -> Vec<String> {
        vec![
            self.calc.clone(),
            "-a".to_string(),
            arg(req.input),
            "-b".to_string(),
            arg(req.mask_out),
            "-expr".to_string(),
            "a*step(b)".to_string(),
            "-prefix".to_string(),
            arg(req.brain_out),
        ]
    }

    fn mean_argv(&self, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut argv = vec![self.mean.clone(), "-prefix".to_string(), arg(output)];
        argv.extend(inputs.iter().map(|p| arg(p)));
        argv
    }

    fn dilate_argv(&self, mask: &Path, voxels: u32, output: &Path) -> Vec<String> {
        vec![
            self.mask_tool.clone(),
            "-input".to_string(),
            arg(mask),
            "-dilate_input".to_string(),
            voxels.to_string(),
            "-prefix".to_string(),
            arg(output),
        ]
    }

    fn allineate_argv(&self, req: &AffineRegistration<'_>) -> Vec<String> {
        let mut argv = vec![
            self.allineate.clone(),
            "-base".to_string(),
            arg(req.reference),
            "-source".to_string(),
            arg(req.moving),
            "-prefix".to_string(),
            arg(req.output),
            "-1Dmatrix_save".to_string(),
            arg(req.transform_out),
            "-warp".to_string(),
            "affine_general".to_string(),
            "-cost".to_string(),
            self.cost.clone(),
        ];
        if let Some(weight) = req.weight {
            argv.push("-weight".to_string());
            argv.push(arg(weight));
        }
        argv
    }

    fn apply_argv(&self, req: &ApplyTransform<'_>) -> Vec<String> {
        let interp = match req.interpolation {
            Interpolation::Linear => "linear",
            Interpolation::NearestNeighbour => "NN",
        };
        vec![
            self.allineate.clone(),
            "-source".to_string(),
            arg(req.moving),
            "-master".to_string(),
            arg(req.reference),
            "-1Dmatrix_apply".to_string(),
            arg(req.transform),
            "-final".to_string(),
            interp.to_string(),
            "-prefix".to_string(),
            arg(req.output),
        ]
    }
}

/// [`RegistrationBackend`] that runs external programs as subprocesses.
#[derive(Debug, Clone, Default)]
pub struct CommandBackend {
    commands: ToolCommands,
}

impl CommandBackend {
    pub fn new(commands: ToolCommands) -> Self {
        Self { commands }
    }

    pub fn commands(&self) -> &ToolCommands {
        &self.commands
    }

    /// Fail fast when a program the run needs is not installed.
    pub fn check_available(&self, method: ExtractionMethod) -> Result<(), ToolError> {
        for program in self.commands.required_programs(method) {
            match find_program(program) {
                Some(path) => info!(tool = %program, path = %path.display(), "tool found"),
                None => {
                    return Err(ToolError::Unavailable {
                        tool: program.to_string(),
                        reason: "not found on PATH".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn exec(&self, argv: Vec<String>) -> Result<(), ToolError> {
        let out = ToolRunner::run(&argv, self.commands.timeout_secs).await?;
        debug!(
            tool = %out.tool,
            duration_ms = out.duration_ms,
            stdout = %tail(&out.stdout, LOG_TAIL),
            stderr = %tail(&out.stderr, LOG_TAIL),
            "tool finished"
        );
        Ok(())
    }
}

#[async_trait]
impl RegistrationBackend for CommandBackend {
    async fn extract_brain(&self, req: &BrainExtraction<'_>) -> Result<(), ToolError> {
        self.exec(self.commands.mask_argv(req)).await?;
        self.exec(self.commands.apply_mask_argv(req)).await
    }

    async fn average(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        self.exec(self.commands.mean_argv(inputs, output)).await
    }

    async fn dilate_mask(&self, mask: &Path, voxels: u32, output: &Path) -> Result<(), ToolError> {
        self.exec(self.commands.dilate_argv(mask, voxels, output)).await
    }

    async fn affine_register(&self, req: &AffineRegistration<'_>) -> Result<(), ToolError> {
        self.exec(self.commands.allineate_argv(req)).await
    }

    async fn apply_transform(&self, req: &ApplyTransform<'_>) -> Result<(), ToolError> {
        self.exec(self.commands.apply_argv(req)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rats_extraction_passes_resolution() {
        let cmds = ToolCommands::default();
        let req = BrainExtraction {
            input: Path::new("anat.nii.gz"),
            brain_out: Path::new("brain.nii.gz"),
            mask_out: Path::new("mask.nii.gz"),
            method: ExtractionMethod::Rats,
            resolution: 400.0,
        };
        let argv = cmds.mask_argv(&req);
        assert_eq!(argv[0], "RATS_MM");
        assert_eq!(argv.last().map(String::as_str), Some("400"));
    }

    #[test]
    fn test_histogram_extraction_uses_skull_strip() {
        let cmds = ToolCommands::default();
        let req = BrainExtraction {
            input: Path::new("anat.nii.gz"),
            brain_out: Path::new("brain.nii.gz"),
            mask_out: Path::new("mask.nii.gz"),
            method: ExtractionMethod::Histogram,
            resolution: 400.0,
        };
        assert_eq!(cmds.mask_argv(&req)[0], "3dSkullStrip");
        assert!(cmds.apply_mask_argv(&req).contains(&"brain.nii.gz".to_string()));
    }

    #[test]
    fn test_weighted_registration_adds_weight() {
        let cmds = ToolCommands::default();
        let mut req = AffineRegistration {
            moving: Path::new("head.nii.gz"),
            reference: Path::new("template.nii.gz"),
            output: Path::new("out.nii.gz"),
            transform_out: Path::new("out.aff12.1D"),
            weight: None,
            resolution: 400.0,
        };
        assert!(!cmds.allineate_argv(&req).contains(&"-weight".to_string()));
        req.weight = Some(Path::new("weight.nii.gz"));
        let argv = cmds.allineate_argv(&req);
        let pos = argv.iter().position(|a| a == "-weight").expect("weight flag");
        assert_eq!(argv[pos + 1], "weight.nii.gz");
    }

    #[test]
    fn test_masks_resampled_nearest_neighbour() {
        let cmds = ToolCommands::default();
        let req = ApplyTransform {
            moving: Path::new("mask.nii.gz"),
            transform: Path::new("brain.aff12.1D"),
            reference: Path::new("template.nii.gz"),
            output: Path::new("mask_init.nii.gz"),
            interpolation: Interpolation::NearestNeighbour,
        };
        assert!(cmds.apply_argv(&req).contains(&"NN".to_string()));
    }

    #[test]
    fn test_check_available_reports_missing_tool() {
        let backend = CommandBackend::new(ToolCommands {
            skull_strip: "commonspace-missing-skullstrip".to_string(),
            ..ToolCommands::default()
        });
        let err = backend.check_available(ExtractionMethod::Histogram).unwrap_err();
        assert_eq!(err.tool(), "commonspace-missing-skullstrip");
    }

    #[test]
    fn test_tool_commands_deserialize_with_defaults() {
        let cmds: ToolCommands = serde_json::from_str(r#"{ "allineate": "/opt/afni/3dAllineate" }"#).unwrap();
        assert_eq!(cmds.allineate, "/opt/afni/3dAllineate");
        assert_eq!(cmds.mean, "3dMean");
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_successful_program_output_is_logged() {
        let backend = CommandBackend::new(ToolCommands {
            mean: "echo".to_string(),
            ..ToolCommands::default()
        });
        backend
            .average(&[PathBuf::from("a.nii")], Path::new("mean.nii"))
            .await
            .unwrap();
        assert!(logs_contain("tool finished"));
        assert!(logs_contain("duration_ms"));
        assert!(logs_contain("-prefix mean.nii"));
    }

    #[tokio::test]
    async fn test_failing_program_surfaces_as_tool_error() {
        let backend = CommandBackend::new(ToolCommands {
            mean: "false".to_string(),
            ..ToolCommands::default()
        });
        let err = backend
            .average(&[PathBuf::from("a.nii")], Path::new("mean.nii"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }
}
