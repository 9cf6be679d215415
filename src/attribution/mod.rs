//! Maps the pid of a GPU process to the container that owns it.
//!
//! Attribution is best effort: a process can exit between enumeration and
//! inspection, its cgroup record can be invisible from the monitor's
//! namespace, and the runtime can be slow or absent. Every one of these ends
//! in the `"unknown"` placeholder, never in an error for the caller.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use data_model::UNKNOWN;
use tracing::{debug, warn};

use crate::config::AttributionStrategy;

pub mod cgroup;
pub mod runtime;

pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};

#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("cgroup record {path:?} of pid {pid} is unreadable: {source}")]
    CgroupUnreadable {
        pid: u32,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reading the cgroup record of pid {pid} timed out")]
    CgroupTimeout { pid: u32 },

    #[error("no container pattern matches the cgroup record of pid {pid}")]
    NoPatternMatch { pid: u32 },

    #[error("no running container pid appears in the cgroup record of pid {pid}")]
    NotInContainerTable { pid: u32 },

    #[error("container {container_id} of pid {pid} could not be resolved: {source}")]
    Runtime {
        pid: u32,
        container_id: String,
        #[source]
        source: RuntimeError,
    },
}

impl AttributionError {
    /// Host processes and exited processes are routine; everything else
    /// points at a misconfiguration worth surfacing.
    fn is_routine(&self) -> bool {
        matches!(
            self,
            AttributionError::NoPatternMatch { .. }
                | AttributionError::NotInContainerTable { .. }
                | AttributionError::CgroupUnreadable { .. }
        )
    }
}

pub struct ContainerAttributor {
    proc_root: PathBuf,
    strategy: AttributionStrategy,
    runtime: Arc<dyn ContainerRuntime>,
    read_timeout: Duration,
}

impl ContainerAttributor {
    pub fn new(
        proc_root: PathBuf,
        strategy: AttributionStrategy,
        runtime: Arc<dyn ContainerRuntime>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            proc_root,
            strategy,
            runtime,
            read_timeout,
        }
    }

    /// Prepares attribution for one poll. With the container-table strategy
    /// this lists the running containers once, so every process of the poll
    /// is matched against the same table.
    pub async fn begin_cycle(&self) -> CycleAttribution<'_> {
        let container_pids = match self.strategy {
            AttributionStrategy::CgroupPattern => None,
            AttributionStrategy::ContainerTable => match self.runtime.container_pids().await {
                Ok(pids) => {
                    debug!(containers = pids.len(), "Built container pid table");
                    Some(pids)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to list containers, processes will be unattributed");
                    Some(BTreeMap::new())
                }
            },
        };
        CycleAttribution {
            attributor: self,
            container_pids,
        }
    }
}

pub struct CycleAttribution<'a> {
    attributor: &'a ContainerAttributor,
    container_pids: Option<BTreeMap<u32, String>>,
}

impl CycleAttribution<'_> {
    /// Name of the container owning `pid`, or `"unknown"`.
    pub async fn container_for(&self, pid: u32) -> String {
        match self.try_container_for(pid).await {
            Ok(name) => name,
            Err(e) => {
                if e.is_routine() {
                    debug!(pid, error = %e, "Process not attributed to a container");
                } else {
                    warn!(pid, error = %e, "Container attribution failed");
                }
                UNKNOWN.to_string()
            }
        }
    }

    pub async fn try_container_for(&self, pid: u32) -> Result<String, AttributionError> {
        let cgroup =
            cgroup::read_cgroup(&self.attributor.proc_root, pid, self.attributor.read_timeout)
                .await?;
        match &self.container_pids {
            None => self.by_pattern(pid, &cgroup).await,
            Some(container_pids) => by_container_table(pid, &cgroup, container_pids),
        }
    }

    async fn by_pattern(&self, pid: u32, cgroup: &str) -> Result<String, AttributionError> {
        let (pattern, container_id) = cgroup::extract_container_id(cgroup)
            .ok_or(AttributionError::NoPatternMatch { pid })?;
        debug!(pid, pattern, container_id, "Matched container cgroup");
        self.attributor
            .runtime
            .container_name(container_id)
            .await
            .map(|name| name.trim_start_matches('/').to_string())
            .map_err(|source| AttributionError::Runtime {
                pid,
                container_id: container_id.to_string(),
                source,
            })
    }
}

/// A process is owned by a container when it is the container's main
/// process, or when the container's pid shows up in its cgroup record.
/// The substring test can produce false positives for short pids.
fn by_container_table(
    pid: u32,
    cgroup: &str,
    container_pids: &BTreeMap<u32, String>,
) -> Result<String, AttributionError> {
    if let Some(name) = container_pids.get(&pid) {
        return Ok(name.clone());
    }
    container_pids
        .iter()
        .find(|(container_pid, _)| cgroup.contains(&container_pid.to_string()))
        .map(|(_, name)| name.clone())
        .ok_or(AttributionError::NotInContainerTable { pid })
}
