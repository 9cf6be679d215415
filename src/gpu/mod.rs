//! Local GPU enumeration through `nvidia-smi`.
//!
//! Each poll issues three independent CSV queries: GPU identifiers, GPU
//! summary and compute processes. The queries share no state, so the
//! canonical GPU index is the only way to join their rows.

use std::time::Duration;

use async_trait::async_trait;

use crate::exec::{self, ExecError};

pub mod aliases;
pub mod processes;
pub mod sampler;

pub use aliases::GpuAliasTable;
pub use processes::sample_processes;
pub use sampler::sample_gpus;

/// The queries issued against the enumeration tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuQueryKind {
    /// `uuid, bus id, index` per GPU.
    Aliases,
    /// `index, name, total memory MiB, utilization %` per GPU.
    Summary,
    /// `gpu uuid, gpu bus id, pid, process name, used memory MiB` per
    /// compute process.
    ComputeApps,
}

impl GpuQueryKind {
    pub fn args(&self) -> [&'static str; 2] {
        let query = match self {
            GpuQueryKind::Aliases => "--query-gpu=gpu_uuid,gpu_bus_id,index",
            GpuQueryKind::Summary => "--query-gpu=index,name,memory.total,utilization.gpu",
            GpuQueryKind::ComputeApps => {
                "--query-compute-apps=gpu_uuid,gpu_bus_id,pid,process_name,used_gpu_memory"
            }
        };
        [query, "--format=csv,noheader,nounits"]
    }
}

/// Source of raw CSV text for the GPU queries.
#[async_trait]
pub trait GpuQuery: Send + Sync {
    async fn query(&self, kind: GpuQueryKind) -> Result<String, ExecError>;
}

/// Queries the `nvidia-smi` binary.
pub struct NvidiaSmi {
    binary: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(binary: String, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl GpuQuery for NvidiaSmi {
    async fn query(&self, kind: GpuQueryKind) -> Result<String, ExecError> {
        exec::run_bounded(&self.binary, kind.args(), self.timeout)
            .await?
            .into_stdout(&self.binary)
    }
}
