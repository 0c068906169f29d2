//! Allow-list-gated subprocess execution.
//!
//! Every process this tool spawns — the spec build, the package-manager
//! invocations — goes through here. The program token is checked against
//! the command allow-list before any spawn, output is captured through
//! piped stdio, and the child is killed on timeout or cancellation via
//! `kill_on_drop`.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command_safety::is_command_allowed;
use crate::error::{Error, Result};
use crate::util::or_cancel;

/// Captured result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output for error analysis: stderr first (where compilers
    /// put diagnostics), then stdout.
    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stderr.len() + self.stdout.len() + 1);
        combined.push_str(&self.stderr);
        if !self.stderr.is_empty() && !self.stdout.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&self.stdout);
        combined
    }
}

/// Spawns allow-listed commands with a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `command` with `args`, capturing stdout and stderr.
    ///
    /// The program token must pass the allow-list gate; paths and
    /// argument-carrying tokens are rejected there, so a caller cannot
    /// smuggle `/usr/bin/x` or `x --flag` through as a program name.
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        if !is_command_allowed(command) {
            warn!(command, "refusing to spawn disallowed command");
            return Err(Error::CommandNotAllowed(command.to_string()));
        }

        debug!(command, ?args, "spawning process");
        let start = Instant::now();

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound(command.to_string())
            } else {
                Error::Io(e)
            }
        })?;

        // On timeout or cancellation the in-flight future (and the child
        // with it) is dropped, and kill_on_drop reaps the process.
        let waited = tokio::time::timeout(self.timeout, or_cancel(child.wait_with_output(), cancel))
            .await
            .map_err(|_| Error::ProcessTimeout {
                command: command.to_string(),
                timeout: self.timeout,
            })?;
        let output = waited??;

        let result = ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        };
        debug!(
            command,
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "process completed"
        );
        Ok(result)
    }
}
