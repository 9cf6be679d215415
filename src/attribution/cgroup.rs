use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use tokio::io::AsyncReadExt;

use super::AttributionError;

/// cgroup records are a handful of lines; anything past this is not read.
const MAX_CGROUP_BYTES: u64 = 64 * 1024;

/// Extracts a container id from one known cgroup path shape.
struct CgroupPattern {
    name: &'static str,
    regex: Regex,
}

impl CgroupPattern {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("cgroup pattern must compile"),
        }
    }

    fn extract<'a>(&self, cgroup: &'a str) -> Option<&'a str> {
        self.regex
            .captures(cgroup)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str())
    }
}

/// Tried in order, the first match wins.
static CGROUP_PATTERNS: LazyLock<Vec<CgroupPattern>> = LazyLock::new(|| {
    vec![
        // cgroupfs driver: /docker/<id>
        CgroupPattern::new("docker", r"/docker/([0-9a-f]{12,64})"),
        // systemd driver: /system.slice/docker-<id>.scope
        CgroupPattern::new("systemd-scope", r"docker-([0-9a-f]{12,64})\.scope"),
        // scope seen from a nested cgroup namespace
        CgroupPattern::new("nested-scope", r"/\.\./docker-([0-9a-f]{64})\.scope"),
    ]
});

/// Returns the container id found in a cgroup record along with the name of
/// the pattern that matched.
pub fn extract_container_id(cgroup: &str) -> Option<(&'static str, &str)> {
    CGROUP_PATTERNS
        .iter()
        .find_map(|pattern| pattern.extract(cgroup).map(|id| (pattern.name, id)))
}

pub fn cgroup_path(proc_root: &Path, pid: u32) -> PathBuf {
    proc_root.join(pid.to_string()).join("cgroup")
}

/// Reads the cgroup membership record of `pid`, bounded in size and time.
pub async fn read_cgroup(
    proc_root: &Path,
    pid: u32,
    timeout: Duration,
) -> Result<String, AttributionError> {
    let path = cgroup_path(proc_root, pid);
    let read = async {
        let file = tokio::fs::File::open(&path).await?;
        let mut content = String::new();
        file.take(MAX_CGROUP_BYTES)
            .read_to_string(&mut content)
            .await?;
        Ok::<_, std::io::Error>(content)
    };
    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(content)) => Ok(content),
        Ok(Err(source)) => Err(AttributionError::CgroupUnreadable { pid, path, source }),
        Err(_) => Err(AttributionError::CgroupTimeout { pid }),
    }
}
