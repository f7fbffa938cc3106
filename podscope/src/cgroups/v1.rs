//! Legacy (v1) hierarchy reader
//!
//! CPU accounting comes from the cpuacct controller in USER_HZ ticks and
//! nanoseconds; both are normalized to microseconds here.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::cgroups::parse::{read_i64, read_kv, read_pids, read_u64};
use crate::cgroups::{missing_file, CgroupReader, CpuQuota, CpuUsage, CGROUP_ROOT};
use crate::domain::Result;

/// USER_HZ; the kernel ABI fixes this at 100 on every supported arch.
const CLOCK_TICKS: u64 = 100;
const MICROS_PER_SECOND: u64 = 1_000_000;

pub struct CgroupV1 {
    root: PathBuf,
}

impl Default for CgroupV1 {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupV1 {
    #[must_use]
    pub fn new() -> CgroupV1 {
        CgroupV1 { root: PathBuf::from(CGROUP_ROOT) }
    }

    /// Reader over a fake hierarchy root, for tests.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> CgroupV1 {
        CgroupV1 { root: root.into() }
    }

    fn path(&self, subsys: &str, suffix: &str, file: &str) -> PathBuf {
        self.root.join(subsys).join(suffix.trim_start_matches('/')).join(file)
    }
}

impl CgroupReader for CgroupV1 {
    fn name(&self) -> &str {
        "legacy"
    }

    fn cpu_usage(&self, suffix: &str) -> Result<CpuUsage> {
        let stat = read_kv(&self.path("cpu", suffix, "cpuacct.stat"))?;
        let usage_ns = read_u64(&self.path("cpu", suffix, "cpuacct.usage"))?;

        let user = stat.get("user").copied().unwrap_or(0) * MICROS_PER_SECOND / CLOCK_TICKS;
        let system = stat.get("system").copied().unwrap_or(0) * MICROS_PER_SECOND / CLOCK_TICKS;

        Ok(CpuUsage { user, system, usage: usage_ns / 1000 })
    }

    fn cpu_stat_raw(&self, suffix: &str) -> Result<HashMap<String, u64>> {
        read_kv(&self.path("cpu", suffix, "cpu.stat"))
    }

    fn cpu_quota_and_period(&self, suffix: &str) -> Result<CpuQuota> {
        let period = read_u64(&self.path("cpu", suffix, "cpu.cfs_period_us"))?;
        let quota = read_i64(&self.path("cpu", suffix, "cpu.cfs_quota_us"))?;

        if quota == -1 {
            return Ok(CpuQuota { quota: u64::MAX, period });
        }
        Ok(CpuQuota { quota: quota.max(0) as u64, period })
    }

    fn memory_stat_raw(&self, suffix: &str) -> Result<HashMap<String, u64>> {
        read_kv(&self.path("memory", suffix, "memory.stat"))
    }

    fn memory_event_raw(&self, suffix: &str) -> Result<HashMap<String, u64>> {
        // native v1 has no memory.events; treat absence as empty
        match read_kv(&self.path("memory", suffix, "memory.events")) {
            Ok(kv) => Ok(kv),
            Err(e) if missing_file(&e) => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }

    fn tasks(&self, suffix: &str) -> Result<Vec<i32>> {
        read_pids(&self.path("cpu", suffix, "tasks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, CgroupV1) {
        let dir = tempfile::tempdir().unwrap();
        let cg = dir.path().join("cpu/kubepods/pod1/abc");
        std::fs::create_dir_all(&cg).unwrap();
        std::fs::write(cg.join("cpuacct.stat"), "user 250\nsystem 50\n").unwrap();
        std::fs::write(cg.join("cpuacct.usage"), "3000000000\n").unwrap();
        std::fs::write(cg.join("cpu.cfs_period_us"), "100000\n").unwrap();
        std::fs::write(cg.join("cpu.cfs_quota_us"), "-1\n").unwrap();
        std::fs::write(cg.join("cpu.stat"), "nr_periods 10\nnr_throttled 2\nthrottled_time 5\n")
            .unwrap();
        std::fs::write(cg.join("tasks"), "10\n20\n").unwrap();
        let mem = dir.path().join("memory/kubepods/pod1/abc");
        std::fs::create_dir_all(&mem).unwrap();
        std::fs::write(mem.join("memory.stat"), "cache 4096\nrss 8192\n").unwrap();
        let reader = CgroupV1::with_root(dir.path());
        (dir, reader)
    }

    #[test]
    fn test_cpu_usage_normalizes_to_micros() {
        let (_dir, reader) = fixture();
        let usage = reader.cpu_usage("/kubepods/pod1/abc").unwrap();
        // 250 ticks at USER_HZ=100 -> 2.5 s -> 2_500_000 µs
        assert_eq!(usage.user, 2_500_000);
        assert_eq!(usage.system, 500_000);
        // 3 s in ns -> µs
        assert_eq!(usage.usage, 3_000_000);
    }

    #[test]
    fn test_unlimited_quota_maps_to_max() {
        let (_dir, reader) = fixture();
        let quota = reader.cpu_quota_and_period("/kubepods/pod1/abc").unwrap();
        assert_eq!(quota.quota, u64::MAX);
        assert_eq!(quota.period, 100_000);
    }

    #[test]
    fn test_missing_memory_events_is_empty() {
        let (_dir, reader) = fixture();
        let events = reader.memory_event_raw("/kubepods/pod1/abc").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_tasks() {
        let (_dir, reader) = fixture();
        assert_eq!(reader.tasks("/kubepods/pod1/abc").unwrap(), vec![10, 20]);
    }
}
