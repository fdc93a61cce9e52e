//! In-process stand-in for the external registration tools.
//!
//! Every output is a digest of the operation, its parameters and the
//! contents of its inputs, so identical calls produce byte-identical files
//! and any change upstream changes everything downstream. Calls are recorded
//! so tests can count how much work a run did.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest as Sha2Digest, Sha256};

use crate::backend::{
    AffineRegistration, ApplyTransform, BrainExtraction, RegistrationBackend, ToolError,
};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub op: &'static str,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: &'static str,
    path_contains: Option<String>,
}

/// Deterministic fake [`RegistrationBackend`].
#[derive(Debug, Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<FakeCall>>,
    failures: Mutex<Vec<FailureRule>>,
    ignore_reference: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration output depends only on the moving image, so the running
    /// average stops changing after the first realignment.
    pub fn converging() -> Self {
        let backend = Self::default();
        backend.ignore_reference.store(true, Ordering::SeqCst);
        backend
    }

    /// Make `op` fail when its input or output path contains `path_contains`
    /// (or always, when `None`).
    pub fn fail_on(&self, op: &'static str, path_contains: Option<&str>) {
        self.failures.lock().unwrap().push(FailureRule {
            op,
            path_contains: path_contains.map(str::to_string),
        });
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Total number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of calls to `op` made so far.
    pub fn calls_for(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.op == op).count()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn begin(&self, op: &'static str, paths: &[&Path], output: &Path) -> Result<(), ToolError> {
        self.calls.lock().unwrap().push(FakeCall {
            op,
            output: output.to_path_buf(),
        });

        let failures = self.failures.lock().unwrap();
        let hit = failures.iter().any(|rule| {
            rule.op == op
                && rule.path_contains.as_deref().map_or(true, |needle| {
                    paths
                        .iter()
                        .chain(std::iter::once(&output))
                        .any(|p| p.to_string_lossy().contains(needle))
                })
        });
        if hit {
            return Err(ToolError::Failed {
                tool: op.to_string(),
                exit_code: 1,
                stderr: format!("injected failure for {}", output.display()),
            });
        }
        Ok(())
    }
}

/// Hash `op`, `params` and the contents of `inputs`; reading a missing input fails like a tool would.
fn fingerprint(op: &str, params: &str, inputs: &[&Path]) -> Result<String, ToolError> {
    let mut hasher = Sha256::new();
    hasher.update(op.as_bytes());
    hasher.update(b"\0");
    hasher.update(params.as_bytes());
    for input in inputs {
        let data = fs::read(input).map_err(|e| ToolError::Failed {
            tool: op.to_string(),
            exit_code: 2,
            stderr: format!("cannot read {}: {e}", input.display()),
        })?;
        hasher.update(b"\0");
        hasher.update(&data);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn emit(op: &str, output: &Path, body: &str) -> Result<(), ToolError> {
    fs::write(output, format!("{op}\n{body}\n")).map_err(|e| ToolError::Failed {
        tool: op.to_string(),
        exit_code: 3,
        stderr: format!("cannot write {}: {e}", output.display()),
    })
}

#[async_trait]
impl RegistrationBackend for FakeBackend {
    async fn extract_brain(&self, req: &BrainExtraction<'_>) -> Result<(), ToolError> {
        const OP: &str = "extract_brain";
        self.begin(OP, &[req.input], req.brain_out)?;
        let params = format!("{}:{}", req.method.as_str(), req.resolution);
        let hash = fingerprint(OP, &params, &[req.input])?;
        emit(OP, req.brain_out, &format!("brain {hash}"))?;
        emit(OP, req.mask_out, &format!("mask {hash}"))
    }

    async fn average(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        const OP: &str = "average";
        let refs: Vec<&Path> = inputs.iter().map(PathBuf::as_path).collect();
        self.begin(OP, &refs, output)?;
        let hash = fingerprint(OP, "", &refs)?;
        emit(OP, output, &hash)
    }

    async fn dilate_mask(&self, mask: &Path, voxels: u32, output: &Path) -> Result<(), ToolError> {
        const OP: &str = "dilate_mask";
        self.begin(OP, &[mask], output)?;
        let hash = fingerprint(OP, &voxels.to_string(), &[mask])?;
        emit(OP, output, &hash)
    }

    async fn affine_register(&self, req: &AffineRegistration<'_>) -> Result<(), ToolError> {
        const OP: &str = "affine_register";
        let mut inputs = vec![req.moving, req.reference];
        inputs.extend(req.weight);
        self.begin(OP, &inputs, req.output)?;

        if self.ignore_reference.load(Ordering::SeqCst) {
            // Still require the reference to exist.
            fingerprint(OP, "", &inputs)?;
            inputs = vec![req.moving];
        }
        let hash = fingerprint(OP, &req.resolution.to_string(), &inputs)?;
        emit(OP, req.output, &format!("image {hash}"))?;
        emit(OP, req.transform_out, &format!("affine {hash}"))
    }

    async fn apply_transform(&self, req: &ApplyTransform<'_>) -> Result<(), ToolError> {
        const OP: &str = "apply_transform";
        let inputs = [req.moving, req.transform, req.reference];
        self.begin(OP, &inputs, req.output)?;
        let params = format!("{:?}", req.interpolation);
        let hash = fingerprint(OP, &params, &inputs)?;
        emit(OP, req.output, &hash)
    }
}
