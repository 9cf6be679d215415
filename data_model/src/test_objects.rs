pub mod tests {
    use serde_json::Value;

    use crate::{AttributedProcess, FleetRow, GpuDescriptor, GpuIndex, ProcessSample};

    pub const TEST_GPU_UUID_0: &str = "GPU-5f3c2a10-8d1e-4b7a-9c11-0a2b3c4d5e60";
    pub const TEST_GPU_UUID_1: &str = "GPU-7a9e4b21-1c2d-4e3f-8a5b-6c7d8e9f0a11";
    pub const TEST_GPU_BUS_0: &str = "00000000:3B:00.0";
    pub const TEST_GPU_BUS_1: &str = "00000000:AF:00.0";

    pub fn mock_gpu(index: u32, memory_total_mib: u64) -> GpuDescriptor {
        GpuDescriptor {
            index,
            name: "NVIDIA A100-SXM4-80GB".to_string(),
            memory_total_mib,
            utilization_percent: 0,
        }
    }

    pub fn mock_process_sample(pid: u32, gpu_uuid: &str, used_memory_mib: u64) -> ProcessSample {
        ProcessSample {
            pid,
            gpu_uuid: Some(gpu_uuid.to_string()),
            gpu_bus_id: None,
            used_memory_mib,
            process_name: "python".to_string(),
        }
    }

    pub fn mock_attributed_process(pid: u32, gpu_index: GpuIndex, memory_mib: u64) -> AttributedProcess {
        AttributedProcess {
            pid,
            gpu_index,
            gpu_uuid: None,
            container: "trainer".to_string(),
            process: "python".to_string(),
            command: "python train.py".to_string(),
            memory_mib,
        }
    }

    pub fn mock_row(fields: &[(&str, Value)]) -> FleetRow {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}
