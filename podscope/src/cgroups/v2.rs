//! Unified (v2) hierarchy reader

use std::collections::HashMap;
use std::path::PathBuf;

use crate::cgroups::parse::{read_kv, read_pids};
use crate::cgroups::{CgroupReader, CpuQuota, CpuUsage, CGROUP_ROOT};
use crate::domain::{AgentError, Result};

pub struct CgroupV2 {
    root: PathBuf,
}

impl Default for CgroupV2 {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupV2 {
    #[must_use]
    pub fn new() -> CgroupV2 {
        CgroupV2 { root: PathBuf::from(CGROUP_ROOT) }
    }

    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> CgroupV2 {
        CgroupV2 { root: root.into() }
    }

    fn path(&self, suffix: &str, file: &str) -> PathBuf {
        self.root.join(suffix.trim_start_matches('/')).join(file)
    }
}

/// Parse `cpu.max`: `"<quota|max> <period>"`.
pub fn parse_cpu_max(content: &str) -> Result<CpuQuota> {
    let mut fields = content.split_whitespace();
    let (Some(quota), Some(period)) = (fields.next(), fields.next()) else {
        return Err(AgentError::InvalidArgs(format!("malformed cpu.max: {content:?}")));
    };

    let period = period
        .parse::<u64>()
        .map_err(|_| AgentError::InvalidArgs(format!("malformed cpu.max period: {content:?}")))?;
    let quota = if quota == "max" {
        u64::MAX
    } else {
        quota
            .parse::<u64>()
            .map_err(|_| AgentError::InvalidArgs(format!("malformed cpu.max quota: {content:?}")))?
    };

    Ok(CpuQuota { quota, period })
}

impl CgroupReader for CgroupV2 {
    fn name(&self) -> &str {
        "unified"
    }

    fn cpu_usage(&self, suffix: &str) -> Result<CpuUsage> {
        let stat = read_kv(&self.path(suffix, "cpu.stat"))?;
        Ok(CpuUsage {
            user: stat.get("user_usec").copied().unwrap_or(0),
            system: stat.get("system_usec").copied().unwrap_or(0),
            usage: stat.get("usage_usec").copied().unwrap_or(0),
        })
    }

    fn cpu_stat_raw(&self, suffix: &str) -> Result<HashMap<String, u64>> {
        read_kv(&self.path(suffix, "cpu.stat"))
    }

    fn cpu_quota_and_period(&self, suffix: &str) -> Result<CpuQuota> {
        let path = self.path(suffix, "cpu.max");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AgentError::file(path.display().to_string(), e))?;
        parse_cpu_max(&content)
    }

    fn memory_stat_raw(&self, suffix: &str) -> Result<HashMap<String, u64>> {
        read_kv(&self.path(suffix, "memory.stat"))
    }

    fn memory_event_raw(&self, suffix: &str) -> Result<HashMap<String, u64>> {
        read_kv(&self.path(suffix, "memory.events"))
    }

    fn tasks(&self, suffix: &str) -> Result<Vec<i32>> {
        read_pids(&self.path(suffix, "cgroup.threads"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_max_unlimited() {
        let quota = parse_cpu_max("max 100000").unwrap();
        assert_eq!(quota.quota, u64::MAX);
        assert_eq!(quota.period, 100_000);
    }

    #[test]
    fn test_parse_cpu_max_limited() {
        let quota = parse_cpu_max("50000 100000").unwrap();
        assert_eq!(quota.quota, 50_000);
        assert_eq!(quota.period, 100_000);
    }

    #[test]
    fn test_parse_cpu_max_rejects_garbage() {
        assert!(parse_cpu_max("").is_err());
        assert!(parse_cpu_max("max").is_err());
        assert!(parse_cpu_max("abc 100000").is_err());
    }

    #[test]
    fn test_cpu_usage_reads_usec_fields() {
        let dir = tempfile::tempdir().unwrap();
        let cg = dir.path().join("kubepods.slice/pod.slice");
        std::fs::create_dir_all(&cg).unwrap();
        std::fs::write(
            cg.join("cpu.stat"),
            "usage_usec 123456789\nuser_usec 100000000\nsystem_usec 23456789\nnr_throttled 50\n",
        )
        .unwrap();

        let reader = CgroupV2::with_root(dir.path());
        let usage = reader.cpu_usage("/kubepods.slice/pod.slice").unwrap();
        assert_eq!(usage.user, 100_000_000);
        assert_eq!(usage.system, 23_456_789);
        assert_eq!(usage.usage, 123_456_789);
    }

    #[test]
    fn test_threads_list() {
        let dir = tempfile::tempdir().unwrap();
        let cg = dir.path().join("kubepods.slice");
        std::fs::create_dir_all(&cg).unwrap();
        std::fs::write(cg.join("cgroup.threads"), "100\n200\n300\n").unwrap();

        let reader = CgroupV2::with_root(dir.path());
        assert_eq!(reader.tasks("/kubepods.slice").unwrap(), vec![100, 200, 300]);
    }
}
