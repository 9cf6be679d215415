use async_trait::async_trait;

use crate::{
    config::RemoteServer,
    exec::{self, CommandOutput, ExecError},
};

/// Everything needed to run the aggregation command on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub options: Vec<String>,
    pub command: String,
}

impl Invocation {
    pub fn new(server: &RemoteServer, options: &[String], command: &str) -> Self {
        Self {
            host: server.host.clone(),
            user: server.user.clone(),
            port: server.port,
            options: options.to_vec(),
            command: command.to_string(),
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `-p <port> <options…> <user>@<host> <command>`
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        args.extend(self.options.iter().cloned());
        args.push(self.target());
        args.push(self.command.clone());
        args
    }
}

/// Runs an [`Invocation`] and returns the raw output. The caller owns the
/// deadline: dropping the returned future must stop the remote call.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError>;
}

pub struct SshExecutor {
    ssh_binary: String,
}

impl SshExecutor {
    pub fn new(ssh_binary: String) -> Self {
        Self { ssh_binary }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        exec::run_to_completion(&self.ssh_binary, invocation.ssh_args()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let server = RemoteServer {
            host: "gpu-01".to_string(),
            user: "ubuntu".to_string(),
            port: 2222,
        };
        let options = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        let invocation = Invocation::new(&server, &options, "/usr/local/bin/gpu_docker_metrics.sh");
        assert_eq!(
            invocation.ssh_args(),
            vec![
                "-p",
                "2222",
                "-o",
                "BatchMode=yes",
                "ubuntu@gpu-01",
                "/usr/local/bin/gpu_docker_metrics.sh"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_ssh_binary() {
        let executor = SshExecutor::new("gpuwatch-missing-ssh".to_string());
        let invocation = Invocation::new(
            &RemoteServer {
                host: "gpu-01".to_string(),
                user: "ubuntu".to_string(),
                port: 22,
            },
            &[],
            "true",
        );
        assert!(matches!(
            executor.execute(&invocation).await,
            Err(ExecError::Spawn { .. })
        ));
    }
}
