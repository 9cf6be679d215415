use data_model::ProcessSample;
use gpuwatch_utils::non_placeholder;
use tracing::{debug, warn};

use super::{GpuQuery, GpuQueryKind};

const COMPUTE_APPS_FIELDS: usize = 5;

/// Enumerates GPU-resident compute processes. A failing tool yields an empty
/// sample.
pub async fn sample_processes(query: &dyn GpuQuery) -> Vec<ProcessSample> {
    match query.query(GpuQueryKind::ComputeApps).await {
        Ok(text) => parse_compute_apps(&text),
        Err(e) => {
            warn!(error = %e, "GPU process enumeration unavailable");
            Vec::new()
        }
    }
}

/// Parses `gpu_uuid, gpu_bus_id, pid, process_name, used_gpu_memory` rows.
///
/// The tool output is variable-width text, so each bad row is dropped on its
/// own and never fails the whole sample.
pub fn parse_compute_apps(text: &str) -> Vec<ProcessSample> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let sample = parse_compute_app_row(line);
            if sample.is_none() {
                debug!(line = %line, "Dropping malformed compute process row");
            }
            sample
        })
        .collect()
}

fn parse_compute_app_row(line: &str) -> Option<ProcessSample> {
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() != COMPUTE_APPS_FIELDS {
        return None;
    }
    let pid = parts[2].parse::<u32>().ok()?;
    let used_memory_mib = parts[4].parse::<u64>().ok()?;
    Some(ProcessSample {
        pid,
        gpu_uuid: non_placeholder(parts[0]).map(str::to_string),
        gpu_bus_id: non_placeholder(parts[1]).map(str::to_string),
        used_memory_mib,
        process_name: parts[3].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{TEST_GPU_BUS_0, TEST_GPU_UUID_0};

    use super::*;
    use crate::gpu::test_helpers::FakeGpuQuery;

    #[test]
    fn test_parse_compute_apps() {
        let text = format!(
            "{}, {}, 4242, /usr/bin/python3, 10240\n",
            TEST_GPU_UUID_0, TEST_GPU_BUS_0
        );
        let samples = parse_compute_apps(&text);
        assert_eq!(
            samples,
            vec![ProcessSample {
                pid: 4242,
                gpu_uuid: Some(TEST_GPU_UUID_0.to_string()),
                gpu_bus_id: Some(TEST_GPU_BUS_0.to_string()),
                used_memory_mib: 10240,
                process_name: "/usr/bin/python3".to_string(),
            }]
        );
    }

    #[test]
    fn test_bad_rows_are_dropped_individually() {
        let text = "\
GPU-a, 00000000:01:00.0, 100, python, 512
GPU-b, 00000000:02:00.0, 101, python
GPU-c, 00000000:03:00.0, 102, python, [N/A]
GPU-d, 00000000:04:00.0, abc, python, 64
GPU-e, 00000000:05:00.0, 104, my, app, 64

[N/A], 00000000:06:00.0, 105, python, 128
";
        let samples = parse_compute_apps(text);
        let pids: Vec<u32> = samples.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![100, 105]);
        assert_eq!(samples[1].gpu_uuid, None);
        assert_eq!(samples[1].gpu_bus_id.as_deref(), Some("00000000:06:00.0"));
    }

    #[tokio::test]
    async fn test_failed_query_yields_no_processes() {
        assert!(sample_processes(&FakeGpuQuery::default()).await.is_empty());
    }
}
