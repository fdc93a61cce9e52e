//! Execution of external programs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use super::ToolError;

const STDERR_TAIL: usize = 2000;
/// How much of a successful tool's output ends up in the debug log.
pub(crate) const LOG_TAIL: usize = 400;

/// Captured result of a successful tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool: String,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs one external program to completion.
pub struct ToolRunner;

impl ToolRunner {
    /// Run `argv[0]` with the remaining arguments.
    ///
    /// A program that cannot be spawned is `Unavailable`; a non-zero exit is
    /// `Failed` with the tail of stderr. `timeout_secs == 0` waits forever.
    pub async fn run(argv: &[String], timeout_secs: u64) -> Result<ToolOutput, ToolError> {
        let Some((exe, args)) = argv.split_first() else {
            return Err(ToolError::Unavailable {
                tool: String::new(),
                reason: "empty command".to_string(),
            });
        };
        let start = Instant::now();
        debug!(tool = %exe, args = ?args, "spawning tool");

        let child = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Unavailable {
                tool: exe.clone(),
                reason: e.to_string(),
            })?;

        let output = if timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
                .await
                .map_err(|_| ToolError::TimedOut {
                    tool: exe.clone(),
                    timeout_secs,
                })?
        } else {
            child.wait_with_output().await
        }
        .map_err(|e| ToolError::Failed {
            tool: exe.clone(),
            exit_code: -1,
            stderr: e.to_string(),
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: exe.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: tail(&stderr, STDERR_TAIL),
            });
        }

        Ok(ToolOutput {
            tool: exe.clone(),
            stdout,
            stderr,
            duration_ms,
        })
    }
}

pub(crate) fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.trim_end().to_string();
    }
    s.chars().skip(count - max_chars).collect::<String>().trim_end().to_string()
}

/// Resolve `program` the way a shell would: paths are taken as-is, bare names
/// are searched for on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}
