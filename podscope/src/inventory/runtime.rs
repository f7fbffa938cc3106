//! Container runtime adapters
//!
//! The inventory only needs one thing from the runtime: the init pid of a
//! container. Docker keeps it in the container's `config.v2.json`,
//! containerd in a flat `init.pid` file under the shim's task directory.
//! The adapter flavor is chosen lazily from the id prefix kubelet reports
//! (`docker://` or `containerd://`).

use serde::Deserialize;
use std::path::PathBuf;

use crate::domain::{AgentError, Result};

pub const DEFAULT_DOCKER_ROOT: &str = "/var/lib/docker";
pub const DEFAULT_CONTAINERD_STATE: &str = "/run/containerd";

#[derive(Debug, Clone)]
pub enum ContainerRuntime {
    Docker { root_dir: PathBuf },
    Containerd { state_dir: PathBuf },
}

#[derive(Deserialize)]
struct DockerConfigV2 {
    #[serde(rename = "State")]
    state: DockerState,
}

#[derive(Deserialize)]
struct DockerState {
    #[serde(rename = "Pid")]
    pid: i32,
}

impl ContainerRuntime {
    /// Build the adapter for an id prefix from a pod status.
    pub fn from_prefix(prefix: &str, docker_root: &str, containerd_state: &str) -> Result<ContainerRuntime> {
        match prefix {
            "docker" => Ok(ContainerRuntime::Docker { root_dir: PathBuf::from(docker_root) }),
            "containerd" => {
                Ok(ContainerRuntime::Containerd { state_dir: PathBuf::from(containerd_state) })
            }
            other => Err(AgentError::InvalidArgs(format!("unknown container runtime: {other}"))),
        }
    }

    /// The pid-1 of the container.
    pub fn init_pid(&self, container_id: &str) -> Result<i32> {
        match self {
            ContainerRuntime::Docker { root_dir } => {
                let path = root_dir.join("containers").join(container_id).join("config.v2.json");
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| AgentError::file(path.display().to_string(), e))?;
                let config: DockerConfigV2 = serde_json::from_str(&content)?;
                if config.state.pid == 0 {
                    return Err(AgentError::Container {
                        id: container_id.to_string(),
                        reason: "docker reports pid 0".to_string(),
                    });
                }
                Ok(config.state.pid)
            }
            ContainerRuntime::Containerd { state_dir } => {
                let path = state_dir
                    .join("io.containerd.runtime.v2.task")
                    .join("k8s.io")
                    .join(container_id)
                    .join("init.pid");
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| AgentError::file(path.display().to_string(), e))?;
                content.trim().parse().map_err(|_| AgentError::Container {
                    id: container_id.to_string(),
                    reason: format!("malformed init.pid: {content:?}"),
                })
            }
        }
    }
}

/// Split `docker://<id>` / `containerd://<id>` from a pod container status.
pub fn parse_container_id(status_id: &str) -> Result<(&str, &str)> {
    let trimmed = status_id.trim_matches('"');
    trimmed
        .split_once("://")
        .filter(|(prefix, id)| !prefix.is_empty() && !id.is_empty())
        .ok_or_else(|| AgentError::InvalidArgs(format!("invalid container id: {status_id}")))
}
