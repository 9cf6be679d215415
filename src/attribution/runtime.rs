use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    query_parameters::{InspectContainerOptions, ListContainersOptions},
    Docker,
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// The subset of a container runtime needed to name the owner of a process.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human readable name of the container with the given (full or short) id.
    async fn container_name(&self, container_id: &str) -> Result<String, RuntimeError>;

    /// Main pid of every running container, mapped to the container name.
    async fn container_pids(&self) -> Result<BTreeMap<u32, String>, RuntimeError>;
}

/// Docker Engine API client. Constructed once at startup and shared by every
/// poll; each call is bounded by `timeout`.
pub struct DockerRuntime {
    docker: Docker,
    timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the default Docker socket, or to `address` when given.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    pub fn new(address: Option<&str>, timeout: Duration) -> Result<Self> {
        let timeout_secs = timeout.as_secs().max(1);
        let docker = match address {
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
            Some(address) if address.starts_with("http://") || address.starts_with("tcp://") => {
                let addr = address
                    .trim_start_matches("http://")
                    .trim_start_matches("tcp://");
                Docker::connect_with_http(
                    &format!("http://{}", addr),
                    timeout_secs,
                    bollard::API_DEFAULT_VERSION,
                )
                .context("Failed to connect to Docker daemon via HTTP")?
            }
            Some(address) => {
                let socket_path = address.trim_start_matches("unix://");
                Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                    .context("Failed to connect to Docker daemon via Unix socket")?
            }
        };
        Ok(Self { docker, timeout })
    }

    async fn inspect(&self, container_id: &str) -> Result<(String, Option<i64>), RuntimeError> {
        let info = match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(RuntimeError::NotFound(container_id.to_string())),
            Err(e) => return Err(e.into()),
        };
        let name = info
            .name
            .as_deref()
            .map(|name| name.trim_start_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        let pid = info.state.and_then(|state| state.pid);
        Ok((name, pid))
    }

    async fn list_container_pids(&self) -> Result<BTreeMap<u32, String>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(None::<ListContainersOptions>)
            .await?;

        let mut pids = BTreeMap::new();
        for container in containers {
            let Some(id) = container.id else {
                continue;
            };
            match self.inspect(&id).await {
                Ok((name, Some(pid))) if pid > 0 => {
                    pids.insert(pid as u32, name);
                }
                Ok(_) => {}
                // The container may have exited between list and inspect.
                Err(e) => debug!(container_id = %id, error = %e, "Skipping container"),
            }
        }
        Ok(pids)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn container_name(&self, container_id: &str) -> Result<String, RuntimeError> {
        match tokio::time::timeout(self.timeout, self.inspect(container_id)).await {
            Ok(result) => result.map(|(name, _)| name),
            Err(_) => Err(RuntimeError::Timeout(self.timeout)),
        }
    }

    async fn container_pids(&self) -> Result<BTreeMap<u32, String>, RuntimeError> {
        match tokio::time::timeout(self.timeout, self.list_container_pids()).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::collections::HashMap;

    use super::*;

    /// In-memory runtime keyed by container id.
    #[derive(Default)]
    pub struct FakeRuntime {
        pub names: HashMap<String, String>,
        pub pids: BTreeMap<u32, String>,
        pub fail: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn container_name(&self, container_id: &str) -> Result<String, RuntimeError> {
            if self.fail {
                return Err(RuntimeError::Timeout(Duration::from_secs(1)));
            }
            self.names
                .get(container_id)
                .map(|name| name.trim_start_matches('/').to_string())
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
        }

        async fn container_pids(&self) -> Result<BTreeMap<u32, String>, RuntimeError> {
            if self.fail {
                return Err(RuntimeError::Timeout(Duration::from_secs(1)));
            }
            Ok(self.pids.clone())
        }
    }
}
