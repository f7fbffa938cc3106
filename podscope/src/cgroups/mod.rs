//! Uniform read access over cgroup v1 and v2 hierarchies
//!
//! The host's cgroup mode is detected once at startup and selects one of two
//! readers behind [`CgroupReader`]. Paths are always
//! `<root>[/<subsystem>]/<container suffix>/<file>`; the suffix comes from
//! the container inventory.

pub mod parse;
pub mod v1;
pub mod v2;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::domain::{AgentError, Result};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    /// All-v1 hierarchies.
    Legacy,
    /// v2 mounted beside v1 at `unified/`.
    Hybrid,
    /// Pure v2.
    Unified,
}

/// CPU time usage in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuUsage {
    pub user: u64,
    pub system: u64,
    pub usage: u64,
}

/// CFS bandwidth settings; `quota == u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQuota {
    pub quota: u64,
    pub period: u64,
}

pub trait CgroupReader: Send + Sync {
    /// Human-readable hierarchy name (`legacy` or `unified`).
    fn name(&self) -> &str;

    /// User/system/total CPU usage of the cgroup, all in microseconds.
    fn cpu_usage(&self, suffix: &str) -> Result<CpuUsage>;

    /// Raw key-value content of `cpu.stat`.
    fn cpu_stat_raw(&self, suffix: &str) -> Result<HashMap<String, u64>>;

    /// CFS quota and period.
    fn cpu_quota_and_period(&self, suffix: &str) -> Result<CpuQuota>;

    /// Raw key-value content of `memory.stat`.
    fn memory_stat_raw(&self, suffix: &str) -> Result<HashMap<String, u64>>;

    /// Raw key-value content of `memory.events`; empty on hierarchies
    /// without the file.
    fn memory_event_raw(&self, suffix: &str) -> Result<HashMap<String, u64>>;

    /// Thread ids in the cgroup.
    fn tasks(&self, suffix: &str) -> Result<Vec<i32>>;
}

/// Detect the host's cgroup mode from the filesystem.
pub fn cgroup_mode() -> CgroupMode {
    static MODE: OnceLock<CgroupMode> = OnceLock::new();
    *MODE.get_or_init(|| detect_mode(Path::new(CGROUP_ROOT)))
}

fn detect_mode(root: &Path) -> CgroupMode {
    if root.join("cgroup.controllers").exists() {
        CgroupMode::Unified
    } else if root.join("unified/cgroup.controllers").exists() {
        CgroupMode::Hybrid
    } else {
        CgroupMode::Legacy
    }
}

/// Human-readable name of the detected mode, for logs.
#[must_use]
pub fn cgroup_mode_name() -> &'static str {
    match cgroup_mode() {
        CgroupMode::Legacy => "cgroup v1",
        CgroupMode::Hybrid => "cgroup hybrid",
        CgroupMode::Unified => "cgroup v2",
    }
}

/// Build the reader matching the detected mode.
pub fn new_cgroup_reader() -> Result<Box<dyn CgroupReader>> {
    match cgroup_mode() {
        CgroupMode::Legacy => Ok(Box::new(v1::CgroupV1::new())),
        CgroupMode::Hybrid | CgroupMode::Unified => Ok(Box::new(v2::CgroupV2::new())),
    }
}

/// Root path of one v1 subsystem hierarchy.
#[must_use]
pub fn rootfs_path(subsys: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(subsys)
}

/// `<root>/<subsys>/<suffix>/<file>` with the suffix's leading slash folded
/// away.
#[must_use]
pub fn subsys_path(subsys: &str, suffix: &str, file: &str) -> PathBuf {
    rootfs_path(subsys).join(suffix.trim_start_matches('/')).join(file)
}

pub(crate) fn missing_file(err: &AgentError) -> bool {
    match err {
        AgentError::File { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
        AgentError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}
