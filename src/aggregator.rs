//! Joins GPU, process, container and command information into the per-GPU
//! view of one host.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use data_model::{AttributedProcess, GpuDescriptor, GpuUsage, HostView};
use tracing::{info, instrument};

use crate::{
    attribution::ContainerAttributor,
    command_resolver::CommandResolver,
    gpu::{sample_gpus, sample_processes, GpuAliasTable, GpuQuery},
};

pub struct HostAggregator {
    host: String,
    gpu_query: Arc<dyn GpuQuery>,
    attributor: ContainerAttributor,
    commands: CommandResolver,
}

impl HostAggregator {
    pub fn new(
        host: String,
        gpu_query: Arc<dyn GpuQuery>,
        attributor: ContainerAttributor,
        commands: CommandResolver,
    ) -> Self {
        Self {
            host,
            gpu_query,
            attributor,
            commands,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Polls the local GPUs once.
    ///
    /// Processes are attributed one at a time; a poll is triggered by a
    /// caller, not run continuously, so there is no need for parallelism.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn collect(&self) -> HostView {
        let aliases = GpuAliasTable::build(self.gpu_query.as_ref()).await;
        let gpus = sample_gpus(self.gpu_query.as_ref()).await;
        let samples = sample_processes(self.gpu_query.as_ref()).await;

        let attribution = self.attributor.begin_cycle().await;
        let mut processes = Vec::with_capacity(samples.len());
        for sample in samples {
            let gpu_index = aliases.resolve_sample(&sample);
            let container = attribution.container_for(sample.pid).await;
            let command = self
                .commands
                .command_line(sample.pid, &sample.process_name)
                .await;
            processes.push(AttributedProcess::new(sample, gpu_index, container, command));
        }

        let view = build_host_view(self.host.clone(), Utc::now(), gpus, processes);
        info!(
            gpus = view.gpus.len(),
            processes = view.gpus.iter().map(|g| g.processes.len()).sum::<usize>(),
            unattributed = view.unattributed.len(),
            "Collected host GPU usage"
        );
        view
    }
}

/// Groups processes under their GPU and computes memory usage per GPU.
///
/// GPUs come out in ascending index order whatever the input order. A process
/// whose index is unknown, or names a GPU missing from `gpus`, is kept in
/// `unattributed`.
pub fn build_host_view(
    host: String,
    ts_utc: DateTime<Utc>,
    mut gpus: Vec<GpuDescriptor>,
    processes: Vec<AttributedProcess>,
) -> HostView {
    gpus.sort_by_key(|gpu| gpu.index);
    gpus.dedup_by_key(|gpu| gpu.index);

    let mut by_index: BTreeMap<u32, Vec<AttributedProcess>> =
        gpus.iter().map(|gpu| (gpu.index, Vec::new())).collect();
    let mut unattributed = Vec::new();
    for process in processes {
        match process
            .gpu_index
            .known()
            .and_then(|idx| by_index.get_mut(&idx))
        {
            Some(bucket) => bucket.push(process),
            None => unattributed.push(process),
        }
    }

    let gpus = gpus
        .into_iter()
        .map(|gpu| {
            let processes = by_index.remove(&gpu.index).unwrap_or_default();
            let used_mib = processes.iter().map(|p| p.memory_mib).sum();
            GpuUsage {
                index: gpu.index,
                percent_used: GpuUsage::percent_used(used_mib, gpu.memory_total_mib),
                name: gpu.name,
                total_mib: gpu.memory_total_mib,
                used_mib,
                utilization_percent: gpu.utilization_percent,
                processes,
            }
        })
        .collect();

    HostView {
        ts_utc,
        host,
        gpus,
        unattributed,
    }
}
