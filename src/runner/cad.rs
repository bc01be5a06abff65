//! The CAD runner subprocess.
//!
//! Every execute gets a unique temp working directory, a hard wall-clock
//! limit and guaranteed child termination on all exit paths (normal,
//! error, timeout, cancellation). Mesh bytes come back on stdout; failures
//! come back as an exit code plus a stderr traceback.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RunnerError;
use crate::recovery::RunnerEnvelope;

/// Exit code reported for an externally killed run.
const TIMEOUT_EXIT_CODE: i32 = 137;

/// Result of one execute: a mesh or a failure envelope.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Binary STL mesh bytes.
    Mesh(Vec<u8>),
    /// The structured failure envelope for classification.
    Failure(RunnerEnvelope),
}

/// The CAD runner contract.
///
/// One child process per execute; no shared state across runs except the
/// temp working directory root.
#[async_trait]
pub trait CadRunner: Send + Sync {
    /// Runs CAD source with a wall-clock limit.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError` for infrastructure failures (cannot spawn,
    /// cancelled). CAD-level failures are data, not errors: they come back
    /// as [`ExecutionOutcome::Failure`].
    async fn execute(
        &self,
        source: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RunnerError>;
}

/// Production runner: spawns the configured interpreter on a script file.
pub struct ProcessCadRunner {
    /// Interpreter command (e.g. `python3`).
    command: String,
}

impl ProcessCadRunner {
    /// Creates a runner using the given interpreter command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// The interpreter command in use.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl CadRunner for ProcessCadRunner {
    async fn execute(
        &self,
        source: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RunnerError> {
        let execute_id = format!("exec-{}", Uuid::new_v4());
        let workdir = tempfile::Builder::new()
            .prefix(&format!("cad-forge-{}-", execute_id))
            .tempdir()
            .map_err(|e| RunnerError::Setup(format!("failed to create workdir: {}", e)))?;

        let script_path = workdir.path().join("script.py");
        tokio::fs::write(&script_path, source)
            .await
            .map_err(|e| RunnerError::Setup(format!("failed to write script: {}", e)))?;

        tracing::debug!(
            execute_id = %execute_id,
            script = %script_path.display(),
            timeout_secs = timeout.as_secs(),
            "Executing CAD script"
        );

        let child = tokio::process::Command::new(&self.command)
            .arg(&script_path)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child must never outlive this call, whatever path exits it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| RunnerError::Spawn(e.to_string()))?
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "CAD runner timed out");
                return Ok(ExecutionOutcome::Failure(RunnerEnvelope::new(
                    TIMEOUT_EXIT_CODE,
                    format!("killed: exceeded wall-clock limit of {:?}", timeout),
                )));
            }
            _ = cancel.cancelled() => {
                return Err(RunnerError::Cancelled);
            }
        };

        let exit_code = output.status.code().unwrap_or(TIMEOUT_EXIT_CODE);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            if validate_stl(&output.stdout) {
                return Ok(ExecutionOutcome::Mesh(output.stdout));
            }
            return Ok(ExecutionOutcome::Failure(RunnerEnvelope::new(
                crate::recovery::classifier::exit_code::RUNTIME,
                "runner exited 0 but produced no valid mesh",
            )));
        }

        Ok(ExecutionOutcome::Failure(RunnerEnvelope::new(
            exit_code, stderr,
        )))
    }
}

/// Minimal STL envelope validation.
///
/// Accepts binary STL (80-byte header, little-endian triangle count, 50
/// bytes per triangle) and non-empty ASCII STL (`solid` prefix).
pub fn validate_stl(bytes: &[u8]) -> bool {
    if bytes.starts_with(b"solid") {
        return bytes.len() > 5;
    }

    if bytes.len() < 84 {
        return false;
    }

    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    count > 0 && bytes.len() == 84 + count * 50
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A binary STL envelope with the given triangle count.
    fn binary_stl(triangles: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; 80];
        bytes.extend_from_slice(&(triangles as u32).to_le_bytes());
        bytes.extend(std::iter::repeat(0u8).take(triangles * 50));
        bytes
    }

    #[test]
    fn test_validate_stl_binary() {
        assert!(validate_stl(&binary_stl(12)));
        assert!(!validate_stl(&binary_stl(0)));

        // Truncated body.
        let mut bad = binary_stl(2);
        bad.pop();
        assert!(!validate_stl(&bad));
    }

    #[test]
    fn test_validate_stl_ascii() {
        assert!(validate_stl(b"solid cube\nendsolid cube\n"));
        assert!(!validate_stl(b"solid"));
        assert!(!validate_stl(b""));
        assert!(!validate_stl(b"short"));
    }

    #[tokio::test]
    async fn test_failure_envelope_from_exit_code() {
        // `false` exits 1 with no output; any POSIX shell has it.
        let runner = ProcessCadRunner::new("false");
        let outcome = runner
            .execute("ignored", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Failure(envelope) => assert_eq!(envelope.exit_code, 1),
            ExecutionOutcome::Mesh(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_clean_exit_without_mesh_is_failure() {
        let runner = ProcessCadRunner::new("true");
        let outcome = runner
            .execute("ignored", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Failure(envelope) => {
                assert!(envelope.stderr.contains("no valid mesh"));
            }
            ExecutionOutcome::Mesh(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_timeout_produces_timeout_envelope() {
        let runner = ProcessCadRunner::new("sleep");
        // The script path is passed as the first argument; `sleep` cannot
        // parse it, but on platforms where it errors instantly we still
        // only assert the timeout path when it hangs. Use a command that
        // ignores its argument and blocks instead.
        let runner = if cfg!(unix) {
            ProcessCadRunner::new("yes")
        } else {
            runner
        };

        let outcome = runner
            .execute("ignored", Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Failure(envelope) => {
                assert_eq!(envelope.exit_code, TIMEOUT_EXIT_CODE);
                assert!(envelope.stderr.contains("wall-clock"));
            }
            ExecutionOutcome::Mesh(_) => panic!("expected timeout failure"),
        }
    }

    #[tokio::test]
    async fn test_cancellation() {
        let runner = if cfg!(unix) {
            ProcessCadRunner::new("yes")
        } else {
            ProcessCadRunner::new("sleep")
        };

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner
            .execute("ignored", Duration::from_secs(30), &cancel)
            .await;
        assert!(matches!(result, Err(RunnerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let runner = ProcessCadRunner::new("definitely-not-a-command-xyz");
        let result = runner
            .execute("ignored", Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RunnerError::Spawn(_))));
    }
}
