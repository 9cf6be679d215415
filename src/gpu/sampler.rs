use data_model::GpuDescriptor;
use gpuwatch_utils::{non_placeholder, unwrap_or_continue};
use tracing::{debug, warn};

use super::{GpuQuery, GpuQueryKind};

/// Enumerates the local GPUs. An unavailable or failing tool yields an empty
/// list: a host without GPUs is a valid state.
pub async fn sample_gpus(query: &dyn GpuQuery) -> Vec<GpuDescriptor> {
    match query.query(GpuQueryKind::Summary).await {
        Ok(text) => parse_gpu_summary(&text),
        Err(e) => {
            warn!(error = %e, "GPU enumeration unavailable, reporting no GPUs");
            Vec::new()
        }
    }
}

/// Parses `index, name, memory.total, utilization.gpu` rows. Rows with a wrong
/// shape or a non-numeric index or memory size are skipped.
pub fn parse_gpu_summary(text: &str) -> Vec<GpuDescriptor> {
    let mut gpus = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() != 4 {
            debug!(line = %line, "Unexpected GPU summary row format");
            continue;
        }
        let index = unwrap_or_continue!(parts[0].parse::<u32>().ok());
        let memory_total_mib = unwrap_or_continue!(parts[2].parse::<u64>().ok());
        let utilization_percent = non_placeholder(parts[3])
            .and_then(|u| u.parse::<u32>().ok())
            .unwrap_or(0);
        gpus.push(GpuDescriptor {
            index,
            name: parts[1].to_string(),
            memory_total_mib,
            utilization_percent,
        });
    }
    gpus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::test_helpers::FakeGpuQuery;

    #[test]
    fn test_parse_gpu_summary() {
        let text = "0, NVIDIA A100-SXM4-80GB, 81920, 37\n1, NVIDIA A100-SXM4-80GB, 81920, 0\n";
        let gpus = parse_gpu_summary(text);
        assert_eq!(gpus.len(), 2);
        assert_eq!(
            gpus[0],
            GpuDescriptor {
                index: 0,
                name: "NVIDIA A100-SXM4-80GB".to_string(),
                memory_total_mib: 81920,
                utilization_percent: 37,
            }
        );
        assert_eq!(gpus[1].index, 1);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let text = "\
0, Tesla T4, 15360, 12
garbage
1, Tesla T4, unknown, 5
x, Tesla T4, 15360, 5
2, Tesla T4, 15360, [N/A]
";
        let gpus = parse_gpu_summary(text);
        let indices: Vec<u32> = gpus.iter().map(|g| g.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(gpus[1].utilization_percent, 0);
    }

    #[tokio::test]
    async fn test_unavailable_tool_yields_no_gpus() {
        let query = FakeGpuQuery::default();
        assert!(sample_gpus(&query).await.is_empty());

        let query = FakeGpuQuery::default().with(GpuQueryKind::Summary, "");
        assert!(sample_gpus(&query).await.is_empty());
    }
}
