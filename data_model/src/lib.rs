pub mod test_objects;

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

/// Placeholder for anything that could not be resolved: a container, a
/// process name or a GPU index.
pub const UNKNOWN: &str = "unknown";

/// Maximum number of characters kept from a failed host's diagnostic output.
pub const MAX_ERROR_CHARS: usize = 800;

/// Canonical GPU index, the join key between independent GPU and process
/// queries.
///
/// Serialized as a JSON number, or as the string `"unknown"` when a process
/// could not be matched to any GPU of the current enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GpuIndex {
    Known(u32),
    Unknown,
}

impl GpuIndex {
    pub fn known(&self) -> Option<u32> {
        match self {
            GpuIndex::Known(idx) => Some(*idx),
            GpuIndex::Unknown => None,
        }
    }
}

impl Display for GpuIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuIndex::Known(idx) => write!(f, "{}", idx),
            GpuIndex::Unknown => write!(f, "{}", UNKNOWN),
        }
    }
}

impl Serialize for GpuIndex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            GpuIndex::Known(idx) => serializer.serialize_u32(*idx),
            GpuIndex::Unknown => serializer.serialize_str(UNKNOWN),
        }
    }
}

impl<'de> Deserialize<'de> for GpuIndex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(GpuIndex::Known)
                .ok_or_else(|| de::Error::custom(format!("invalid gpu index: {}", n))),
            Value::String(s) if s == UNKNOWN => Ok(GpuIndex::Unknown),
            Value::String(s) => s
                .parse::<u32>()
                .map(GpuIndex::Known)
                .map_err(|_| de::Error::custom(format!("invalid gpu index: {}", s))),
            other => Err(de::Error::custom(format!("invalid gpu index: {}", other))),
        }
    }
}

/// One local GPU as reported by a single enumeration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDescriptor {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub utilization_percent: u32,
}

/// A GPU-resident compute process as reported by the enumeration tool.
///
/// Either identifier may be missing; the alias tables try the uuid first and
/// the PCI bus id second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub gpu_uuid: Option<String>,
    pub gpu_bus_id: Option<String>,
    pub used_memory_mib: u64,
    pub process_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedProcess {
    pub pid: u32,
    pub gpu_index: GpuIndex,
    pub gpu_uuid: Option<String>,
    pub container: String,
    pub process: String,
    pub command: String,
    pub memory_mib: u64,
}

impl AttributedProcess {
    pub fn new(sample: ProcessSample, gpu_index: GpuIndex, container: String, command: String) -> Self {
        Self {
            pid: sample.pid,
            gpu_index,
            gpu_uuid: sample.gpu_uuid,
            container,
            process: sample.process_name,
            command,
            memory_mib: sample.used_memory_mib,
        }
    }
}

/// Memory usage of one GPU, with the processes attributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuUsage {
    pub index: u32,
    pub name: String,
    pub total_mib: u64,
    pub used_mib: u64,
    pub percent_used: f64,
    pub utilization_percent: u32,
    pub processes: Vec<AttributedProcess>,
}

impl GpuUsage {
    /// Percentage of `total_mib` taken by `used_mib`, rounded to one decimal.
    /// A GPU reporting zero total memory is 0% used.
    pub fn percent_used(used_mib: u64, total_mib: u64) -> f64 {
        if total_mib == 0 {
            return 0.0;
        }
        (used_mib as f64 / total_mib as f64 * 1000.0).round() / 10.0
    }
}

/// Per-GPU view of a single host for one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostView {
    pub ts_utc: DateTime<Utc>,
    pub host: String,
    /// Sorted by ascending GPU index.
    pub gpus: Vec<GpuUsage>,
    /// Processes whose GPU identifier matched none of the current GPUs.
    pub unattributed: Vec<AttributedProcess>,
}

impl HostView {
    /// Flattens the view into the row schema consumed by the fleet
    /// coordinator, one row per process.
    pub fn to_fleet_rows(&self) -> Vec<FleetRow> {
        let known = self.gpus.iter().flat_map(|gpu| {
            gpu.processes
                .iter()
                .map(move |p| self.fleet_row(p, Some(gpu)))
        });
        let unknown = self.unattributed.iter().map(|p| self.fleet_row(p, None));
        known.chain(unknown).collect()
    }

    fn fleet_row(&self, process: &AttributedProcess, gpu: Option<&GpuUsage>) -> FleetRow {
        let mut row = Map::new();
        row.insert(row_keys::SERVER.to_string(), json!(self.host));
        row.insert(row_keys::GPU_IDX.to_string(), json!(process.gpu_index));
        row.insert(row_keys::CONTAINER.to_string(), json!(process.container));
        row.insert(row_keys::PROCESS.to_string(), json!(process.process));
        row.insert(row_keys::VRAM_MB.to_string(), json!(process.memory_mib));
        row.insert("pid".to_string(), json!(process.pid));
        row.insert("command".to_string(), json!(process.command));
        if let Some(gpu) = gpu {
            row.insert(row_keys::GPU_UTIL.to_string(), json!(gpu.utilization_percent));
            row.insert("gpu_name".to_string(), json!(gpu.name));
        }
        row
    }
}

/// A row emitted by a remote agent. Agents of different versions emit
/// different subsets of fields, so rows stay loosely typed and are
/// normalized with [`apply_row_defaults`].
pub type FleetRow = Map<String, Value>;

pub mod row_keys {
    pub const SERVER: &str = "server";
    pub const GPU_IDX: &str = "gpu_idx";
    pub const CONTAINER: &str = "container";
    pub const CONTAINER_USER: &str = "container_user";
    pub const GPU_UTIL: &str = "gpu_util";
    pub const VRAM_MB: &str = "vram_mb";
    pub const PROCESS: &str = "process";
}

/// Fills in the fixed row schema. Only missing keys are set; present values
/// and unknown extra keys are left untouched.
pub fn apply_row_defaults(row: &mut FleetRow, host: &str) {
    let defaults = [
        (row_keys::SERVER, json!(host)),
        (row_keys::GPU_IDX, json!(-1)),
        (row_keys::CONTAINER, json!(UNKNOWN)),
        (row_keys::CONTAINER_USER, json!("root")),
        (row_keys::GPU_UTIL, json!(0)),
        (row_keys::VRAM_MB, json!(0)),
        (row_keys::PROCESS, json!(UNKNOWN)),
    ];
    for (key, value) in defaults {
        row.entry(key).or_insert(value);
    }
}

/// Outcome of polling one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReport {
    pub host: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub data: Vec<FleetRow>,
}

impl HostReport {
    pub fn success(host: String, data: Vec<FleetRow>, elapsed_ms: u64) -> Self {
        Self {
            host,
            ok: true,
            error: None,
            data,
            elapsed_ms,
        }
    }

    pub fn failure(host: String, error: String, elapsed_ms: u64) -> Self {
        Self {
            host,
            ok: false,
            error: Some(error),
            data: Vec::new(),
            elapsed_ms,
        }
    }
}

/// Merged view of a whole fleet for one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub ts_utc: DateTime<Utc>,
    pub servers: Vec<HostReport>,
    pub rows: Vec<FleetRow>,
}

impl AggregateSnapshot {
    /// Builds the snapshot, flattening the rows of successful hosts only and
    /// normalizing each of them.
    pub fn from_reports(ts_utc: DateTime<Utc>, servers: Vec<HostReport>) -> Self {
        let rows = servers
            .iter()
            .filter(|report| report.ok)
            .flat_map(|report| {
                report.data.iter().cloned().map(|mut row| {
                    apply_row_defaults(&mut row, &report.host);
                    row
                })
            })
            .collect();
        Self {
            ts_utc,
            servers,
            rows,
        }
    }
}
