use std::{env, fmt::Debug, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";
const HOST_PROC_ENV: &str = "HOST_PROC";
const DEFAULT_REMOTE_COMMAND: &str = "/usr/local/bin/gpu_docker_metrics.sh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    #[serde(default)]
    pub enable_tracing: bool,
    /// OpenTelemetry collector grpc endpoint. Defaults to the
    /// OTEL_EXPORTER_OTLP_ENDPOINT env var or localhost:4317.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// How a GPU process is mapped to the container that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttributionStrategy {
    /// Extract a container id from the process cgroup path and inspect it.
    #[default]
    CgroupPattern,
    /// Match the pids of running containers against the process cgroup
    /// record. Less precise, but works when cgroup paths are not visible in
    /// the expected shape (e.g. the monitor runs in another namespace).
    ContainerTable,
}

/// Settings for polling the GPUs of the host the monitor runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root of the process filesystem holding `<pid>/cgroup`. When the
    /// monitor runs in a container, mount the host's /proc and point this at
    /// it. The HOST_PROC env var takes precedence.
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default)]
    pub attribution: AttributionStrategy,
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi: String,
    /// Upper bound for every local tool invocation and runtime API call.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Docker daemon address. Uses Docker's default socket when unset.
    #[serde(default)]
    pub docker_address: Option<String>,
    /// Name reported for this host. Defaults to the HOSTNAME env var.
    #[serde(default)]
    pub host_name: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            attribution: AttributionStrategy::default(),
            nvidia_smi: default_nvidia_smi(),
            tool_timeout_secs: default_tool_timeout_secs(),
            docker_address: None,
            host_name: None,
        }
    }
}

impl LocalConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn host_name(&self) -> String {
        self.host_name
            .clone()
            .or_else(|| env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteServer {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

/// Settings for polling remote hosts over ssh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub servers: Vec<RemoteServer>,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Extra flags shared by every ssh invocation, e.g.
    /// `["-o", "BatchMode=yes", "-o", "ConnectTimeout=5"]`.
    #[serde(default)]
    pub ssh_options: Vec<String>,
    /// Command run on every remote host. Its stdout must be empty or a JSON
    /// array of row objects.
    #[serde(default = "default_remote_command")]
    pub remote_command: String,
    /// Commands a caller may request instead of `remote_command`.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            ssh_binary: default_ssh_binary(),
            ssh_options: Vec::new(),
            remote_command: default_remote_command(),
            allowed_commands: Vec::new(),
            max_workers: default_max_workers(),
            timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl FleetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_nvidia_smi() -> String {
    "nvidia-smi".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    5
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_remote_command() -> String {
    DEFAULT_REMOTE_COMMAND.to_string()
}

fn default_max_workers() -> usize {
    16
}

fn default_remote_timeout_secs() -> u64 {
    12
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            listen_addr: default_listen_addr(),
            telemetry: TelemetryConfig::default(),
            local: LocalConfig::default(),
            fleet: FleetConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let mut config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from the environment. Only the process filesystem
    /// root is overridable, so a containerized monitor can be pointed at a
    /// bind-mounted host /proc without editing the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(proc_root) = env::var(HOST_PROC_ENV) {
            if !proc_root.is_empty() {
                self.local.proc_root = PathBuf::from(proc_root);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.fleet.max_workers == 0 {
            return Err(anyhow::anyhow!("fleet.max_workers must be at least 1"));
        }
        if self.fleet.timeout_secs == 0 {
            return Err(anyhow::anyhow!("fleet.timeout_secs must be positive"));
        }
        if self.local.tool_timeout_secs == 0 {
            return Err(anyhow::anyhow!("local.tool_timeout_secs must be positive"));
        }
        if self.fleet.remote_command.trim().is_empty() {
            return Err(anyhow::anyhow!("fleet.remote_command must not be empty"));
        }
        if let Some(server) = self.fleet.servers.iter().find(|s| s.host.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "fleet server entry has an empty host: {:?}",
                server
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.env, "local");
        assert!(!config.structured_logging());
        assert_eq!(config.local.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.local.attribution, AttributionStrategy::CgroupPattern);
        assert_eq!(config.fleet.max_workers, 16);
        assert_eq!(config.fleet.timeout(), Duration::from_secs(12));
        assert!(config.fleet.servers.is_empty());
    }

    #[test]
    fn test_parse_fleet_config() {
        let yaml = r#"
env: production
listen_addr: "127.0.0.1:9000"
fleet:
  ssh_options: ["-o", "BatchMode=yes"]
  servers:
    - host: gpu-01
    - host: gpu-02
      user: admin
      port: 2222
"#;
        let config = ServerConfig::from_yaml_str(yaml).unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.fleet.servers.len(), 2);
        assert_eq!(
            config.fleet.servers[0],
            RemoteServer {
                host: "gpu-01".to_string(),
                user: "ubuntu".to_string(),
                port: 22,
            }
        );
        assert_eq!(config.fleet.servers[1].user, "admin");
        assert_eq!(config.fleet.servers[1].port, 2222);
        assert_eq!(config.fleet.ssh_options, vec!["-o", "BatchMode=yes"]);
        assert_eq!(
            config.fleet.remote_command,
            "/usr/local/bin/gpu_docker_metrics.sh"
        );
    }

    #[test]
    fn test_parse_local_config() {
        let yaml = r#"
local:
  attribution: container_table
  tool_timeout_secs: 3
  docker_address: "unix:///var/run/docker.sock"
  host_name: gpu-07
"#;
        let config = ServerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.local.attribution, AttributionStrategy::ContainerTable);
        assert_eq!(config.local.tool_timeout(), Duration::from_secs(3));
        assert_eq!(config.local.host_name(), "gpu-07");
        assert_eq!(
            config.local.docker_address.as_deref(),
            Some("unix:///var/run/docker.sock")
        );
    }

    #[test]
    fn test_invalid_listen_addr() {
        let yaml = r#"
listen_addr: "not-an-address"
"#;
        let result = ServerConfig::from_yaml_str(yaml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("invalid listen address"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let yaml = r#"
fleet:
  max_workers: 0
"#;
        assert!(ServerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_empty_host_rejected() {
        let yaml = r#"
fleet:
  servers:
    - host: ""
"#;
        assert!(ServerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_unknown_attribution_strategy_rejected() {
        let yaml = r#"
local:
  attribution: guesswork
"#;
        assert!(ServerConfig::from_yaml_str(yaml).is_err());
    }
}
