use std::collections::HashMap;

use data_model::{GpuIndex, ProcessSample};
use gpuwatch_utils::{non_placeholder, unwrap_or_continue, OptionInspectNone};
use tracing::{debug, warn};

use super::{GpuQuery, GpuQueryKind};

/// uuid → index and bus id → index lookups from a single enumeration pass.
///
/// Index assignment can change after a driver or container restart, so the
/// table is rebuilt on every poll and never kept around.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuAliasTable {
    by_uuid: HashMap<String, u32>,
    by_bus_id: HashMap<String, u32>,
}

impl GpuAliasTable {
    pub async fn build(query: &dyn GpuQuery) -> Self {
        match query.query(GpuQueryKind::Aliases).await {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                warn!(error = %e, "GPU identifier query failed, every process will resolve to an unknown GPU");
                Self::default()
            }
        }
    }

    /// Parses `uuid, bus id, index` rows.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();
        for line in text.lines() {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() != 3 {
                if !line.trim().is_empty() {
                    debug!(line = %line, "Unexpected GPU identifier row format");
                }
                continue;
            }
            let index = unwrap_or_continue!(parts[2].parse::<u32>().ok());
            if let Some(uuid) = non_placeholder(parts[0]) {
                table.by_uuid.insert(uuid.to_string(), index);
            }
            if let Some(bus_id) = non_placeholder(parts[1]) {
                table.by_bus_id.insert(normalize_bus_id(bus_id), index);
            }
        }
        table
    }

    /// Resolves by uuid first, then by bus id.
    pub fn resolve(&self, uuid: Option<&str>, bus_id: Option<&str>) -> GpuIndex {
        uuid.and_then(|uuid| self.by_uuid.get(uuid))
            .or_else(|| bus_id.and_then(|bus_id| self.by_bus_id.get(&normalize_bus_id(bus_id))))
            .copied()
            .inspect_none(|| debug!(?uuid, ?bus_id, "GPU identifier matches no known GPU"))
            .map(GpuIndex::Known)
            .unwrap_or(GpuIndex::Unknown)
    }

    pub fn resolve_sample(&self, sample: &ProcessSample) -> GpuIndex {
        self.resolve(sample.gpu_uuid.as_deref(), sample.gpu_bus_id.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty() && self.by_bus_id.is_empty()
    }
}

fn normalize_bus_id(bus_id: &str) -> String {
    bus_id.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{
        TEST_GPU_BUS_0,
        TEST_GPU_BUS_1,
        TEST_GPU_UUID_0,
        TEST_GPU_UUID_1,
    };

    use super::*;
    use crate::gpu::test_helpers::FakeGpuQuery;

    fn table() -> GpuAliasTable {
        GpuAliasTable::parse(&format!(
            "{}, {}, 0\n{}, {}, 1\n",
            TEST_GPU_UUID_0, TEST_GPU_BUS_0, TEST_GPU_UUID_1, TEST_GPU_BUS_1
        ))
    }

    #[test]
    fn test_resolve_by_uuid() {
        assert_eq!(
            table().resolve(Some(TEST_GPU_UUID_1), None),
            GpuIndex::Known(1)
        );
    }

    #[test]
    fn test_uuid_wins_over_bus_id() {
        assert_eq!(
            table().resolve(Some(TEST_GPU_UUID_0), Some(TEST_GPU_BUS_1)),
            GpuIndex::Known(0)
        );
    }

    #[test]
    fn test_falls_back_to_bus_id() {
        let table = table();
        assert_eq!(
            table.resolve(Some("GPU-not-listed"), Some(TEST_GPU_BUS_1)),
            GpuIndex::Known(1)
        );
        // bus ids are matched case-insensitively
        assert_eq!(
            table.resolve(None, Some("00000000:af:00.0")),
            GpuIndex::Known(1)
        );
    }

    #[test]
    fn test_unmatched_identifier_is_unknown() {
        let table = table();
        assert_eq!(
            table.resolve(Some("GPU-not-listed"), Some("00000000:01:00.0")),
            GpuIndex::Unknown
        );
        assert_eq!(table.resolve(None, None), GpuIndex::Unknown);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let table = GpuAliasTable::parse("GPU-a, 00000000:01:00.0\nGPU-b, 00000000:02:00.0, x\n");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_yields_empty_table() {
        let table = GpuAliasTable::build(&FakeGpuQuery::default()).await;
        assert!(table.is_empty());
        assert_eq!(table.resolve(Some(TEST_GPU_UUID_0), None), GpuIndex::Unknown);
    }
}
