//! Command execution inside a named, already-running container.
//!
//! The container is never created or removed here. Each command is run with
//! `docker exec` using a fixed working directory and `TERM`, under `sh -c`,
//! with the command's stderr folded into its stdout so the captured text
//! reads the way it would in a terminal.
//!
//! Every call produces an `ExecutionOutcome`: adapter-level failures
//! (container missing or stopped, CLI missing, daemon errors) are turned into
//! a not-run outcome with exit code `-1` and the failure text in `stderr`.

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use crate::action::ExecutionOutcome;
use crate::config::{BackendConfig, COMMAND_TERM};
use crate::error::{DispatchError, Result};

/// Prefixes the container CLI uses when the daemon, not the command, failed.
const DAEMON_ERROR_MARKERS: &[&str] = &["Error response from daemon", "OCI runtime exec failed"];

// ---------------------------------------------------------------------------
// ExecutionBackend
// ---------------------------------------------------------------------------

/// Runs one command and reports what happened. Never fails; never retries.
pub trait ExecutionBackend {
    fn run(&self, command: &str) -> ExecutionOutcome;
}

/// Decode captured output, replacing invalid UTF-8 instead of failing the
/// whole capture.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// ---------------------------------------------------------------------------
// DockerBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker_bin: PathBuf,
    container: String,
    workdir: String,
}

impl DockerBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            container: config.container.clone(),
            workdir: config.workdir.clone(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Check that the container daemon answers. Returns its version string.
    pub fn ping(&self) -> Result<String> {
        let output = self.invoke(&["version", "--format", "{{.Server.Version}}"])?;
        if !output.status.success() {
            return Err(DispatchError::BackendUnavailable(stderr_text(&output)));
        }
        Ok(decode_lossy(&output.stdout).trim().to_string())
    }

    /// Fail unless the configured container exists and is running.
    pub fn ensure_running(&self) -> Result<()> {
        let output = self.invoke(&[
            "inspect",
            "--type",
            "container",
            "--format",
            "{{.State.Running}}",
            &self.container,
        ])?;
        if !output.status.success() {
            let stderr = stderr_text(&output);
            if stderr.contains("No such") {
                return Err(DispatchError::ContainerNotFound(self.container.clone()));
            }
            return Err(DispatchError::BackendUnavailable(stderr));
        }
        match decode_lossy(&output.stdout).trim() {
            "true" => Ok(()),
            _ => Err(DispatchError::ContainerNotRunning(self.container.clone())),
        }
    }

    /// Run `command` in the container. `Err` only for adapter failures; a
    /// command that exits nonzero is still `Ok`.
    pub fn try_run(&self, command: &str) -> Result<ExecutionOutcome> {
        self.ensure_running()?;

        let term = format!("TERM={COMMAND_TERM}");
        let script = format!("exec 2>&1\n{command}");
        let output = self.invoke(&[
            "exec",
            "--workdir",
            &self.workdir,
            "--env",
            &term,
            &self.container,
            "sh",
            "-c",
            &script,
        ])?;

        let mut combined = decode_lossy(&output.stdout);
        let cli_stderr = decode_lossy(&output.stderr);
        if !output.status.success() && combined.is_empty() {
            if let Some(marker) = DAEMON_ERROR_MARKERS.iter().find(|m| cli_stderr.contains(*m)) {
                tracing::debug!(marker, "container CLI reported a daemon error");
                // Removed between the state check and the exec.
                if cli_stderr.contains("No such container") {
                    return Err(DispatchError::ContainerNotFound(self.container.clone()));
                }
                return Err(DispatchError::BackendUnavailable(cli_stderr.trim().to_string()));
            }
        }

        let Some(exit_code) = output.status.code() else {
            return Err(DispatchError::BackendUnavailable(format!(
                "container CLI terminated by {}",
                output.status
            )));
        };
        combined.push_str(&cli_stderr);
        Ok(ExecutionOutcome::completed(combined, exit_code))
    }

    fn invoke(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                DispatchError::BackendUnavailable(format!(
                    "failed to run '{}': {e}",
                    self.docker_bin.display()
                ))
            })
    }
}

impl ExecutionBackend for DockerBackend {
    fn run(&self, command: &str) -> ExecutionOutcome {
        tracing::info!(container = %self.container, command, "executing command");
        match self.try_run(command) {
            Ok(outcome) => {
                tracing::info!(exit_code = outcome.exit_code, "command completed");
                outcome
            }
            Err(e @ DispatchError::ContainerNotFound(_)) => {
                tracing::error!(container = %self.container, "container not found");
                ExecutionOutcome::not_run(e.to_string())
            }
            Err(e) => {
                tracing::error!(error = %e, "error executing command");
                ExecutionOutcome::not_run(e.to_string())
            }
        }
    }
}

fn stderr_text(output: &Output) -> String {
    let text = decode_lossy(&output.stderr).trim().to_string();
    if text.is_empty() {
        format!("container CLI exited with {}", output.status)
    } else {
        text
    }
}
