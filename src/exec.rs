//! Execution of external tools (`nvidia-smi`, `ps`, `ssh`).
//!
//! None of these tools is guaranteed to terminate, so every child is spawned
//! with `kill_on_drop`: dropping the future that waits on it, including via
//! a timeout, kills the process.

use std::{ffi::OsStr, fmt::Debug, process::Stdio, time::Duration};

use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with status {status:?}: {stderr}")]
    NonZeroExit {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Converts a non-zero exit into an error, keeping stdout on success.
    pub fn into_stdout(self, program: &str) -> Result<String, ExecError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(ExecError::NonZeroExit {
                program: program.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs `program` to completion and captures its output. Callers bound the
/// wait themselves, see [`run_bounded`].
pub async fn run_to_completion<I, S>(program: &str, args: I) -> Result<CommandOutput, ExecError>
where
    I: IntoIterator<Item = S> + Debug,
    S: AsRef<OsStr>,
{
    debug!(program, ?args, "running external command");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ExecError::Wait {
            program: program.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs `program` and kills it if it has not finished within `timeout`.
pub async fn run_bounded<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<CommandOutput, ExecError>
where
    I: IntoIterator<Item = S> + Debug,
    S: AsRef<OsStr>,
{
    match tokio::time::timeout(timeout, run_to_completion(program, args)).await {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout {
            program: program.to_string(),
            timeout,
        }),
    }
}
