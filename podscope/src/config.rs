//! Agent configuration
//!
//! Loaded from a TOML file at startup; every section falls back to its
//! default when absent, and a missing file yields the full default
//! configuration. The control plane may replace the in-memory copy and
//! persist it back.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::{AgentError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/podscope/podscope.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub runtime: RuntimeSection,
    pub kubelet: KubeletSection,
    pub container: ContainerSection,
    pub storage: StorageSection,
    pub bpf: BpfSection,
    pub http: HttpSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Region label stamped on every metric and document.
    pub region: String,
    /// Probe names excluded from registration.
    pub blacklist: Vec<String>,
    /// Container names classified as sidecars.
    pub sidecar_names: Vec<String>,
    /// kubelet's cgroup driver: `cgroupfs` or `systemd`.
    pub cgroup_driver: String,
    /// Interfaces the netdev probe watches; empty watches all but loopback.
    pub netdev_whitelist: Vec<String>,
    /// D-load level above which the dload probe captures stacks.
    pub dload_threshold: f64,
    /// Direct-reclaim stall threshold in nanoseconds.
    pub memory_reclaim_delta_ns: u64,
    /// Cap on concurrently running on-demand tasks.
    pub max_running_tasks: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        RuntimeSection {
            region: String::new(),
            blacklist: Vec::new(),
            sidecar_names: vec!["istio-proxy".to_string()],
            cgroup_driver: "cgroupfs".to_string(),
            netdev_whitelist: Vec::new(),
            dload_threshold: 5.0,
            memory_reclaim_delta_ns: 100_000_000,
            max_running_tasks: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeletSection {
    pub readonly_url: String,
    pub authorized_url: String,
    pub ca_cert_path: String,
    pub client_cert_dir: String,
}

impl Default for KubeletSection {
    fn default() -> Self {
        KubeletSection {
            readonly_url: "http://127.0.0.1:10255/pods".to_string(),
            authorized_url: "https://127.0.0.1:10250/pods".to_string(),
            ca_cert_path: "/etc/kubernetes/pki/ca.crt".to_string(),
            client_cert_dir: "/var/lib/kubelet/pki".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub docker_root: String,
    pub containerd_state: String,
}

impl Default for ContainerSection {
    fn default() -> Self {
        ContainerSection {
            docker_root: crate::inventory::runtime::DEFAULT_DOCKER_ROOT.to_string(),
            containerd_state: crate::inventory::runtime::DEFAULT_CONTAINERD_STATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Index node base URL; empty disables the index backend.
    pub index_address: String,
    pub index_username: String,
    pub index_password: String,
    pub index_name: String,
    pub local_path: String,
    pub rotation_size_mb: u64,
    pub max_backups: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            index_address: String::new(),
            index_username: String::new(),
            index_password: String::new(),
            index_name: "podscope".to_string(),
            local_path: "/var/log/podscope".to_string(),
            rotation_size_mb: 100,
            max_backups: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BpfSection {
    /// Directory holding the companion eBPF objects.
    pub object_dir: String,
}

impl Default for BpfSection {
    fn default() -> Self {
        BpfSection { object_dir: "/usr/lib/podscope/bpf".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub listen: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        HttpSection { listen: "127.0.0.1:19704".to_string() }
    }
}

impl AgentConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<AgentConfig> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AgentConfig::default()),
            Err(e) => return Err(AgentError::file(path.display().to_string(), e)),
        };
        toml::from_str(&content)
            .map_err(|e| AgentError::InvalidArgs(format!("{}: {e}", path.display())))
    }

    /// Persist the current configuration.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AgentError::InvalidArgs(format!("serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::file(parent.display().to_string(), e))?;
        }
        std::fs::write(path, content).map_err(|e| AgentError::file(path.display().to_string(), e))
    }
}
