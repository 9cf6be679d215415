use std::time::Duration;

use tracing::debug;

use crate::exec::{self, ExecError};

const PS: &str = "ps";

/// Looks up the full command line of a process in the process table.
pub struct CommandResolver {
    timeout: Duration,
}

impl CommandResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Command line of `pid`, or `fallback` (the process name reported by the
    /// GPU tool) when it cannot be resolved.
    pub async fn command_line(&self, pid: u32, fallback: &str) -> String {
        match self.try_command_line(pid).await {
            Ok(Some(command)) => command,
            Ok(None) => fallback.to_string(),
            Err(e) => {
                debug!(pid, error = %e, "Command line lookup failed");
                fallback.to_string()
            }
        }
    }

    pub async fn try_command_line(&self, pid: u32) -> Result<Option<String>, ExecError> {
        let pid = pid.to_string();
        let stdout = exec::run_bounded(PS, ["-p", pid.as_str(), "-o", "args="], self.timeout)
            .await?
            .into_stdout(PS)?;
        let command = stdout.trim();
        Ok((!command.is_empty()).then(|| command.to_string()))
    }
}
