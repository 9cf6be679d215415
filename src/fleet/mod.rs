//! Fans the aggregation command out to every configured host and merges the
//! results into one snapshot.
//!
//! Hosts are isolated from each other: each one runs in its own task with
//! its own deadline, and whatever happens to it (timeout, bad exit, garbage
//! output, panic) only ever shows up in its own [`HostReport`].

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use data_model::{AggregateSnapshot, FleetRow, HostReport, MAX_ERROR_CHARS};
use gpuwatch_utils::truncate_chars;
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tracing::{info, info_span, instrument, warn, Instrument};

use crate::{
    config::{FleetConfig, RemoteServer},
    exec::CommandOutput,
};

pub mod remote;

pub use remote::{Invocation, RemoteExecutor, SshExecutor};

/// Error reported for a host that did not answer in time.
pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("remote command is not allowed: {0}")]
    CommandNotAllowed(String),
}

pub struct FleetCoordinator {
    executor: Arc<dyn RemoteExecutor>,
    servers: Vec<RemoteServer>,
    ssh_options: Vec<String>,
    remote_command: String,
    allowed_commands: Vec<String>,
    max_workers: usize,
    timeout: Duration,
}

impl FleetCoordinator {
    pub fn new(config: &FleetConfig, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            servers: config.servers.clone(),
            ssh_options: config.ssh_options.clone(),
            remote_command: config.remote_command.clone(),
            allowed_commands: config.allowed_commands.clone(),
            max_workers: config.max_workers,
            timeout: config.timeout(),
        }
    }

    pub fn servers(&self) -> &[RemoteServer] {
        &self.servers
    }

    /// Picks the command to run remotely. A caller-supplied command is only
    /// accepted when it is the configured one or explicitly allow-listed.
    pub fn resolve_command(&self, requested: Option<&str>) -> Result<String, FleetError> {
        match requested.map(str::trim) {
            None | Some("") => Ok(self.remote_command.clone()),
            Some(command)
                if command == self.remote_command
                    || self.allowed_commands.iter().any(|allowed| allowed == command) =>
            {
                Ok(command.to_string())
            }
            Some(command) => Err(FleetError::CommandNotAllowed(command.to_string())),
        }
    }

    /// Polls every host once with the configured command.
    pub async fn poll(&self) -> AggregateSnapshot {
        self.poll_with_command(&self.remote_command).await
    }

    /// Polls every host once, at most `max_workers` at a time. Reports are
    /// listed in configuration order.
    #[instrument(skip(self), fields(hosts = self.servers.len()))]
    pub async fn poll_with_command(&self, remote_command: &str) -> AggregateSnapshot {
        let workers = self.max_workers.min(self.servers.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut tasks = JoinSet::new();
        for (position, server) in self.servers.iter().enumerate() {
            let poll = HostPoll {
                executor: self.executor.clone(),
                invocation: Invocation::new(server, &self.ssh_options, remote_command),
                timeout: self.timeout,
            };
            let semaphore = semaphore.clone();
            let span = info_span!("poll_host", host = %server.host);
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (position, poll.run().await)
                }
                .instrument(span),
            );
        }

        let mut reports: Vec<Option<HostReport>> = vec![None; self.servers.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, report)) => reports[position] = Some(report),
                Err(e) => warn!(error = %e, "Host poll task failed"),
            }
        }

        let reports: Vec<HostReport> = reports
            .into_iter()
            .zip(&self.servers)
            .map(|(report, server)| {
                report.unwrap_or_else(|| {
                    HostReport::failure(server.host.clone(), "host poll task failed".to_string(), 0)
                })
            })
            .collect();

        let snapshot = AggregateSnapshot::from_reports(Utc::now(), reports);
        info!(
            ok = snapshot.servers.iter().filter(|r| r.ok).count(),
            failed = snapshot.servers.iter().filter(|r| !r.ok).count(),
            rows = snapshot.rows.len(),
            "Fleet poll finished"
        );
        snapshot
    }
}

/// One host's unit of work.
struct HostPoll {
    executor: Arc<dyn RemoteExecutor>,
    invocation: Invocation,
    timeout: Duration,
}

impl HostPoll {
    async fn run(self) -> HostReport {
        let host = self.invocation.host.clone();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.executor.execute(&self.invocation)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let report = match outcome {
            Err(_) => HostReport::failure(host, TIMEOUT_ERROR.to_string(), elapsed_ms),
            Ok(Err(e)) if e.is_timeout() => {
                HostReport::failure(host, TIMEOUT_ERROR.to_string(), elapsed_ms)
            }
            Ok(Err(e)) => HostReport::failure(host, bounded_error(&e.to_string()), elapsed_ms),
            Ok(Ok(output)) => classify_output(host, output, elapsed_ms),
        };
        if report.ok {
            info!(elapsed_ms, rows = report.data.len(), "Host polled");
        } else {
            warn!(elapsed_ms, error = ?report.error, "Host poll failed");
        }
        report
    }
}

/// Turns the output of a finished remote command into a report.
pub fn classify_output(host: String, output: CommandOutput, elapsed_ms: u64) -> HostReport {
    if !output.success() {
        let stderr = output.stderr.trim();
        let diagnostic = if !stderr.is_empty() {
            stderr.to_string()
        } else if !output.stdout.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            match output.status {
                Some(code) => format!("remote command exited with status {}", code),
                None => "remote command was terminated by a signal".to_string(),
            }
        };
        return HostReport::failure(host, bounded_error(&diagnostic), elapsed_ms);
    }

    let stdout = output.stdout.trim();
    if stdout.is_empty() {
        return HostReport::success(host, Vec::new(), elapsed_ms);
    }

    match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Array(items)) => {
            let rows = object_rows(&host, items);
            HostReport::success(host, rows, elapsed_ms)
        }
        // valid JSON of another shape carries no rows
        Ok(_) => HostReport::success(host, Vec::new(), elapsed_ms),
        Err(e) => HostReport::failure(
            host,
            bounded_error(&format!("JSON parse error: {}", e)),
            elapsed_ms,
        ),
    }
}

fn object_rows(host: &str, items: Vec<Value>) -> Vec<FleetRow> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(row) => Some(row),
            other => {
                warn!(host, item = %other, "Dropping non-object row");
                None
            }
        })
        .collect()
}

fn bounded_error(message: &str) -> String {
    truncate_chars(message, MAX_ERROR_CHARS).to_string()
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{test_helpers::*, *};

    fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_classify_rows() {
        let report = classify_output(
            "a".to_string(),
            ok_output(r#"[{"gpu_idx": 0, "vram_mb": 512}, {"gpu_idx": 1}]"#),
            7,
        );
        assert!(report.ok);
        assert_eq!(report.error, None);
        assert_eq!(report.elapsed_ms, 7);
        assert_eq!(report.data.len(), 2);
        assert_eq!(report.data[0]["vram_mb"], json!(512));
    }

    #[test]
    fn test_classify_empty_output() {
        let report = classify_output("a".to_string(), ok_output("  \n"), 1);
        assert!(report.ok);
        assert!(report.data.is_empty());
    }

    #[test]
    fn test_classify_non_array_json() {
        let report = classify_output("a".to_string(), ok_output(r#"{"rows": []}"#), 1);
        assert!(report.ok);
        assert!(report.data.is_empty());
    }

    #[test]
    fn test_classify_non_object_items_dropped() {
        let report = classify_output("a".to_string(), ok_output(r#"[1, {"gpu_idx": 2}, "x"]"#), 1);
        assert!(report.ok);
        assert_eq!(report.data.len(), 1);
    }

    #[test]
    fn test_classify_malformed_json() {
        let report = classify_output("a".to_string(), ok_output("[{\"gpu_idx\": "), 1);
        assert!(!report.ok);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .starts_with("JSON parse error"));
        assert!(report.data.is_empty());
    }

    #[test]
    fn test_classify_non_zero_exit() {
        let output = CommandOutput {
            status: Some(255),
            stdout: "partial".to_string(),
            stderr: "ssh: connect to host a port 22: Connection refused\n".to_string(),
        };
        let report = classify_output("a".to_string(), output, 1);
        assert!(!report.ok);
        assert_eq!(
            report.error.as_deref(),
            Some("ssh: connect to host a port 22: Connection refused")
        );

        // stdout is used when stderr is empty
        let output = CommandOutput {
            status: Some(1),
            stdout: "nvidia-smi not found".to_string(),
            stderr: String::new(),
        };
        let report = classify_output("a".to_string(), output, 1);
        assert_eq!(report.error.as_deref(), Some("nvidia-smi not found"));
    }

    #[test]
    fn test_error_is_truncated() {
        let output = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "e".repeat(5000),
        };
        let report = classify_output("a".to_string(), output, 1);
        assert_eq!(report.error.unwrap().chars().count(), MAX_ERROR_CHARS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_failure_and_timeout_hosts() {
        let executor = FakeExecutor::default()
            .with("fast", FakeHost::stdout(r#"[{"gpu_idx": 0, "container": "trainer"}]"#))
            .with("broken", FakeHost::exit(1, "gpu_docker_metrics.sh: not found"))
            .with("slow", FakeHost::stdout("[]").delayed(Duration::from_secs(60)));
        let coordinator = FleetCoordinator::new(
            &fleet_config(&["fast", "broken", "slow"]),
            Arc::new(executor),
        );

        let snapshot = coordinator.poll().await;
        assert_eq!(snapshot.servers.len(), 3);

        let hosts: Vec<&str> = snapshot.servers.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(hosts, vec!["fast", "broken", "slow"]);

        assert!(snapshot.servers[0].ok);
        assert!(!snapshot.servers[1].ok);
        assert_eq!(
            snapshot.servers[1].error.as_deref(),
            Some("gpu_docker_metrics.sh: not found")
        );
        assert!(!snapshot.servers[2].ok);
        assert_eq!(snapshot.servers[2].error.as_deref(), Some(TIMEOUT_ERROR));
        assert!(snapshot.servers[2].elapsed_ms >= 12_000);

        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows[0]["server"], json!("fast"));
        assert_eq!(snapshot.rows[0]["container"], json!("trainer"));
        assert_eq!(snapshot.rows[0]["container_user"], json!("root"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_is_isolated() {
        let executor = FakeExecutor::default()
            .with("good", FakeHost::stdout(r#"[{"gpu_idx": 1, "vram_mb": 900}]"#).delayed(Duration::from_millis(300)))
            .with("bad", FakeHost::stdout("Welcome to Ubuntu!\n[{"));
        let coordinator =
            FleetCoordinator::new(&fleet_config(&["bad", "good"]), Arc::new(executor));

        let started = Instant::now();
        let snapshot = coordinator.poll().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let bad = &snapshot.servers[0];
        assert!(!bad.ok);
        assert!(bad.error.as_deref().unwrap().contains("JSON parse error"));

        let good = &snapshot.servers[1];
        assert!(good.ok);
        assert_eq!(good.data.len(), 1);
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows[0]["vram_mb"], json!(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_and_panicking_hosts_are_isolated() {
        let executor = FakeExecutor::default()
            .with("hang", FakeHost::Hang)
            .with("panic", FakeHost::Panic)
            .with("ok", FakeHost::stdout("[]"));
        let coordinator = FleetCoordinator::new(
            &fleet_config(&["hang", "panic", "ok", "unreachable"]),
            Arc::new(executor),
        );

        let snapshot = coordinator.poll().await;
        assert_eq!(snapshot.servers[0].error.as_deref(), Some(TIMEOUT_ERROR));
        assert_eq!(
            snapshot.servers[1].error.as_deref(),
            Some("host poll task failed")
        );
        assert!(snapshot.servers[2].ok);
        assert!(!snapshot.servers[3].ok);
        assert!(snapshot.servers[3]
            .error
            .as_deref()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_is_bounded() {
        let mut config = fleet_config(&["a", "b", "c", "d"]);
        config.max_workers = 2;
        let mut executor = FakeExecutor::default();
        for host in ["a", "b", "c", "d"] {
            executor = executor.with(host, FakeHost::stdout("[]").delayed(Duration::from_secs(5)));
        }
        let coordinator = FleetCoordinator::new(&config, Arc::new(executor));

        let started = Instant::now();
        let snapshot = coordinator.poll().await;
        // two waves of two hosts
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(snapshot.servers.iter().all(|r| r.ok));
        // queueing time is not charged to a host
        assert!(snapshot.servers.iter().all(|r| r.elapsed_ms < 6_000));
    }

    #[tokio::test]
    async fn test_empty_fleet() {
        let coordinator = FleetCoordinator::new(&fleet_config(&[]), Arc::new(FakeExecutor::default()));
        let snapshot = coordinator.poll().await;
        assert!(snapshot.servers.is_empty());
        assert!(snapshot.rows.is_empty());
    }

    #[test]
    fn test_command_override_allow_list() {
        let mut config = fleet_config(&["a"]);
        config.allowed_commands = vec!["/opt/gpu/metrics --json".to_string()];
        let coordinator = FleetCoordinator::new(&config, Arc::new(FakeExecutor::default()));

        assert_eq!(
            coordinator.resolve_command(None).unwrap(),
            "/usr/local/bin/gpu_docker_metrics.sh"
        );
        assert_eq!(
            coordinator.resolve_command(Some("/opt/gpu/metrics --json")).unwrap(),
            "/opt/gpu/metrics --json"
        );
        assert!(matches!(
            coordinator.resolve_command(Some("rm -rf /")),
            Err(FleetError::CommandNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_requested_command_is_sent() {
        let executor = Arc::new(FakeExecutor::default().with("a", FakeHost::stdout("[]")));
        let coordinator = FleetCoordinator::new(&fleet_config(&["a"]), executor.clone());
        coordinator.poll_with_command("gpuwatch agent").await;
        assert_eq!(*executor.commands.lock().unwrap(), vec!["gpuwatch agent"]);
    }
}
