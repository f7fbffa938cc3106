//! Container inventory
//!
//! The canonical live-container set for the node. A container is present
//! iff its pod was observed `Running` with every container status also
//! `Running` at the most recent kubelet sync. Lookups are O(1)-ish over a
//! small map and any lookup that crosses the debounce window first drives a
//! sync; the process-wide async mutex serializes syncs with all readers.
//!
//! Kubelet unavailability is tolerated: the last known set is retained and
//! no error surfaces to the caller.

pub mod cgroup_path;
pub mod container;
pub mod css;
pub mod kubelet;
pub mod runtime;

pub use cgroup_path::{cgroupfs_to_systemd, container_cgroup_suffix, systemd_to_cgroupfs, CgroupDriver};
pub use container::{Container, LifeResourceFactory};
pub use css::{CssEntry, CssTracker};
pub use kubelet::{KubeletClient, KubeletConfig};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use log::{debug, info};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::domain::{AgentError, ContainerQos, ContainerType, Result};
use runtime::{parse_container_id, ContainerRuntime};

/// Debounce window between kubelet syncs.
const SYNC_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Container names treated as sidecars.
    pub sidecar_names: Vec<String>,
    pub cgroup_driver: CgroupDriver,
    pub docker_root: String,
    pub containerd_state: String,
}

struct InventoryState {
    containers: HashMap<String, Arc<Container>>,
    last_synced: Option<Instant>,
}

pub struct ContainerInventory {
    state: tokio::sync::Mutex<InventoryState>,
    kubelet: KubeletClient,
    css: Arc<CssTracker>,
    config: InventoryConfig,
    /// Runtime adapter, initialized lazily from the first id prefix seen.
    runtime: OnceLock<ContainerRuntime>,
    prototypes: RwLock<HashMap<String, LifeResourceFactory>>,
    node_hostname: String,
}

impl ContainerInventory {
    #[must_use]
    pub fn new(
        kubelet: KubeletClient,
        css: Arc<CssTracker>,
        config: InventoryConfig,
        node_hostname: String,
    ) -> ContainerInventory {
        ContainerInventory {
            state: tokio::sync::Mutex::new(InventoryState {
                containers: HashMap::new(),
                last_synced: None,
            }),
            kubelet,
            css,
            config,
            runtime: OnceLock::new(),
            prototypes: RwLock::new(HashMap::new()),
            node_hostname,
        }
    }

    /// Register a per-container state prototype. Must happen before the
    /// container exists; duplicate keys are rejected.
    pub fn register_life_resource(&self, key: &str, factory: LifeResourceFactory) -> Result<()> {
        let mut prototypes = self.prototypes.write().unwrap();
        if prototypes.contains_key(key) {
            return Err(AgentError::InvalidArgs(format!("life resource {key} already registered")));
        }
        prototypes.insert(key.to_string(), factory);
        Ok(())
    }

    /// Run `select` over the live set, syncing first when the debounce
    /// window has passed.
    async fn with_live_set<T>(
        &self,
        select: impl FnOnce(&HashMap<String, Arc<Container>>) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let stale = state.last_synced.is_none_or(|at| at.elapsed() > SYNC_STEP);
        if stale {
            self.sync_locked(&mut state).await?;
            state.last_synced = Some(Instant::now());
        }
        Ok(select(&state.containers))
    }

    /// Containers whose type is in `mask`.
    pub async fn get_by_type(&self, mask: ContainerType) -> Result<Vec<Arc<Container>>> {
        self.with_live_set(|all| {
            all.values().filter(|c| c.container_type.matches(mask)).cloned().collect()
        })
        .await
    }

    pub async fn get_all(&self) -> Result<Vec<Arc<Container>>> {
        self.get_by_type(ContainerType::ALL).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Arc<Container>>> {
        self.with_live_set(|all| all.get(id).cloned()).await
    }

    /// Normal containers only, as only those own a pod IP.
    pub async fn get_by_ip(&self, ip: &str) -> Result<Option<Arc<Container>>> {
        self.with_live_set(|all| {
            all.values()
                .find(|c| c.container_type.matches(ContainerType::NORMAL) && c.ip_address == ip)
                .cloned()
        })
        .await
    }

    pub async fn get_by_netns_inode(&self, inode: u64) -> Result<Option<Arc<Container>>> {
        self.with_live_set(|all| {
            all.values()
                .find(|c| {
                    c.container_type.matches(ContainerType::NORMAL)
                        && c.net_namespace_inode == inode
                })
                .cloned()
        })
        .await
    }

    /// First container whose css mapping for `subsys` equals `css`.
    pub async fn get_by_css(&self, css: u64, subsys: &str) -> Result<Option<Arc<Container>>> {
        self.with_live_set(|all| {
            all.values().find(|c| c.css.get(subsys) == Some(&css)).cloned()
        })
        .await
    }

    /// Materialize the full `css address -> container id` map for one
    /// subsystem.
    pub async fn css_to_container_id(&self, subsys: &str) -> Result<HashMap<u64, String>> {
        self.with_live_set(|all| {
            all.values()
                .filter_map(|c| c.css.get(subsys).map(|&addr| (addr, c.id.clone())))
                .collect()
        })
        .await
    }

    async fn sync_locked(&self, state: &mut InventoryState) -> Result<()> {
        let pod_list = match self.kubelet.pod_list().await {
            Ok(list) => list,
            Err(e) => {
                // tolerate kubelet unavailability, keep the last known set
                info!("failed to get pod list: {e}");
                return Ok(());
            }
        };

        // ContainerID -> (pod index, container status)
        let mut new_containers: HashMap<String, (&Pod, &ContainerStatus)> = HashMap::new();
        for pod in &pod_list.items {
            if !kubelet::is_running_pod(pod) {
                continue;
            }
            let statuses = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_deref())
                .unwrap_or_default();
            for status in statuses {
                let Some(runtime_id) = status.container_id.as_deref() else {
                    continue;
                };
                let (prefix, id) = parse_container_id(runtime_id)?;
                self.init_runtime(prefix)?;
                new_containers.insert(id.to_string(), (pod, status));
            }
        }

        // evict containers no longer observed
        state.containers.retain(|id, _| new_containers.contains_key(id));
        // only enrich ids we are not yet tracking
        new_containers.retain(|id, _| !state.containers.contains_key(id));

        for (id, (pod, status)) in new_containers {
            match self.enrich(&id, pod, status) {
                Ok(container) => {
                    info!("tracking container {container}");
                    state.containers.insert(id, Arc::new(container));
                }
                Err(e) => info!("failed to update container {id}: {e}"),
            }
        }

        Ok(())
    }

    fn init_runtime(&self, prefix: &str) -> Result<()> {
        if self.runtime.get().is_some() {
            return Ok(());
        }
        let adapter = ContainerRuntime::from_prefix(
            prefix,
            &self.config.docker_root,
            &self.config.containerd_state,
        )?;
        let _ = self.runtime.set(adapter);
        Ok(())
    }

    fn enrich(&self, id: &str, pod: &Pod, status: &ContainerStatus) -> Result<Container> {
        let container_type = self.classify(&status.name, pod);
        let qos = pod
            .status
            .as_ref()
            .and_then(|s| s.qos_class.as_deref())
            .map_or(ContainerQos::Unknown, ContainerQos::from_class);

        let hostname = if container_type == ContainerType::DAEMON_SET {
            self.node_hostname.clone()
        } else {
            pod.spec
                .as_ref()
                .and_then(|s| s.hostname.clone())
                .or_else(|| pod.metadata.name.clone())
                .unwrap_or_default()
        };

        let runtime = self.runtime.get().ok_or_else(|| AgentError::Container {
            id: id.to_string(),
            reason: "container runtime not initialized".to_string(),
        })?;
        let init_pid = runtime.init_pid(id)?;
        let net_namespace_inode = netns_inode(init_pid)?;

        let pod_uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let cgroup_suffix =
            container_cgroup_suffix(self.config.cgroup_driver, id, pod_uid, qos);

        let started_at: DateTime<Utc> = status
            .state
            .as_ref()
            .and_then(|s| s.running.as_ref())
            .and_then(|r| r.started_at.as_ref())
            .map_or_else(Utc::now, |t| t.0);

        let ip_address = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default();

        let mut container = Container::new(
            id.to_string(),
            status.name.clone(),
            hostname,
            container_type,
            qos,
            ip_address,
            net_namespace_inode,
            init_pid,
            cgroup_suffix,
            self.css.css_for_container(id),
            started_at,
            pod.metadata.namespace.clone().unwrap_or_default(),
        );
        container.populate_life_resources(&self.prototypes.read().unwrap());
        Ok(container)
    }

    fn classify(&self, container_name: &str, pod: &Pod) -> ContainerType {
        let owners = pod.metadata.owner_references.as_deref().unwrap_or_default();
        if owners.is_empty() {
            // deleted or static pods have no owner
            let running =
                pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
            return if running { ContainerType::NORMAL } else { ContainerType::UNKNOWN };
        }
        if owners[0].kind == "DaemonSet" {
            return ContainerType::DAEMON_SET;
        }
        if self.config.sidecar_names.iter().any(|s| s == container_name) {
            return ContainerType::SIDECAR;
        }
        ContainerType::NORMAL
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, containers: Vec<Container>) {
        let mut state = self.state.lock().await;
        state.last_synced = Some(Instant::now());
        state.containers =
            containers.into_iter().map(|c| (c.id.clone(), Arc::new(c))).collect();
    }
}

/// Inode of `/proc/<pid>/ns/net`; stable for the container's lifetime.
fn netns_inode(pid: i32) -> Result<u64> {
    let path = format!("/proc/{pid}/ns/net");
    let meta = std::fs::metadata(&path).map_err(|e| AgentError::file(&path, e))?;
    debug!("netns inode of pid {pid}: {}", meta.ino());
    Ok(meta.ino())
}

/// Inventory wired to an unreachable kubelet, for tests across the crate.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn offline_inventory() -> ContainerInventory {
        let kubelet = KubeletClient::new(KubeletConfig {
            // nothing listens here; syncs fall back to the retained set
            readonly_url: "http://127.0.0.1:1/pods".to_string(),
            authorized_url: "https://127.0.0.1:1/pods".to_string(),
            ca_cert_path: "/nonexistent/ca.crt".to_string(),
            client_cert_dir: "/nonexistent".to_string(),
        });
        let css = Arc::new(CssTracker::with_subsystems("/tmp", vec!["cpu".into(), "memory".into()]));
        ContainerInventory::new(
            kubelet,
            css,
            InventoryConfig {
                sidecar_names: vec!["istio-proxy".to_string()],
                cgroup_driver: CgroupDriver::Cgroupfs,
                docker_root: "/var/lib/docker".to_string(),
                containerd_state: "/run/containerd".to_string(),
            },
            "node-1".to_string(),
        )
    }
}
