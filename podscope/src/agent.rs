//! Agent root object
//!
//! Owns every process-wide singleton (inventory, css tracker, storage,
//! probe registry and managers) and threads them into the subsystems, so
//! nothing hides in globals. Teardown runs in reverse construction order:
//! probes stop, then the css event stream, then storage goes quiet.

use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bpf;
use crate::cgroups;
use crate::config::AgentConfig;
use crate::domain::Result;
use crate::inventory::{
    CgroupDriver, ContainerInventory, CssTracker, InventoryConfig, KubeletClient, KubeletConfig,
};
use crate::metrics::MetricManager;
use crate::probes::{ProbeContext, ProbeManager, ProbeRegistry};
use crate::storage::{IndexBackend, LocalFileBackend, StorageBackend, StorageDispatch};
use crate::tasks::TaskManager;

/// How often the inventory is refreshed in the background regardless of
/// lookups, so an initially unreachable kubelet is eventually picked up.
const INVENTORY_REFRESH: Duration = Duration::from_secs(30 * 60);

pub struct Agent {
    pub config: RwLock<AgentConfig>,
    pub config_path: PathBuf,
    pub inventory: Arc<ContainerInventory>,
    pub css: Arc<CssTracker>,
    pub storage: Arc<StorageDispatch>,
    pub registry: Arc<ProbeRegistry>,
    pub metric_manager: Arc<MetricManager>,
    pub probe_manager: Arc<ProbeManager>,
    pub task_manager: Arc<TaskManager>,
    /// Root token; cancelling it cascades into every subsystem.
    pub shutdown: CancellationToken,
}

impl Agent {
    /// Build and wire every subsystem. Order matters: the css tracker must
    /// be live before the first inventory sync so containers pick up their
    /// css mappings.
    pub async fn bootstrap(config: AgentConfig, config_path: PathBuf) -> Result<Arc<Agent>> {
        bpf::init_bpf_manager()?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let region = config.runtime.region.clone();
        let shutdown = CancellationToken::new();

        let css = Arc::new(CssTracker::new(&config.bpf.object_dir)?);
        if let Err(e) = css.bootstrap(&shutdown).await {
            // containers still sync, just without css attribution
            warn!("css tracker bootstrap failed: {e}");
        }

        let kubelet = KubeletClient::new(KubeletConfig {
            readonly_url: config.kubelet.readonly_url.clone(),
            authorized_url: config.kubelet.authorized_url.clone(),
            ca_cert_path: config.kubelet.ca_cert_path.clone(),
            client_cert_dir: config.kubelet.client_cert_dir.clone(),
        });
        let inventory = Arc::new(ContainerInventory::new(
            kubelet,
            Arc::clone(&css),
            InventoryConfig {
                sidecar_names: config.runtime.sidecar_names.clone(),
                cgroup_driver: CgroupDriver::from_name(&config.runtime.cgroup_driver),
                docker_root: config.container.docker_root.clone(),
                containerd_state: config.container.containerd_state.clone(),
            },
            hostname.clone(),
        ));

        let mut backends: Vec<Box<dyn StorageBackend>> = Vec::new();
        if config.storage.index_address.is_empty() || config.storage.index_username.is_empty() {
            warn!("index storage config incomplete, documents go to local files only");
        } else {
            backends.push(Box::new(IndexBackend::new(
                &config.storage.index_address,
                &config.storage.index_username,
                &config.storage.index_password,
                &config.storage.index_name,
            )?));
        }
        backends.push(Box::new(LocalFileBackend::new(
            &config.storage.local_path,
            config.storage.rotation_size_mb,
            config.storage.max_backups,
        )));
        let storage = Arc::new(StorageDispatch::new(
            backends,
            Arc::clone(&inventory),
            &hostname,
            &region,
        ));

        let ctx = ProbeContext {
            inventory: Arc::clone(&inventory),
            storage: Arc::clone(&storage),
            cgroup: Arc::from(cgroups::new_cgroup_reader()?),
            bpf_dir: PathBuf::from(&config.bpf.object_dir),
            netdev_whitelist: config.runtime.netdev_whitelist.clone(),
            dload_threshold: config.runtime.dload_threshold,
            memory_reclaim_delta_ns: config.runtime.memory_reclaim_delta_ns,
        };
        let registry = Arc::new(ProbeRegistry::build(&ctx, &config.runtime.blacklist)?);

        let metric_manager = Arc::new(MetricManager::new(&registry, &hostname, &region)?);
        let probe_manager = Arc::new(ProbeManager::new(&registry));
        let task_manager = Arc::new(TaskManager::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            config.runtime.max_running_tasks,
        ));

        info!("agent bootstrapped on {hostname} ({})", cgroups::cgroup_mode_name());
        Ok(Arc::new(Agent {
            config: RwLock::new(config),
            config_path,
            inventory,
            css,
            storage,
            registry,
            metric_manager,
            probe_manager,
            task_manager,
            shutdown,
        }))
    }

    /// Start the probes and the background inventory refresh.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.probe_manager.start_all().await?;

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = agent.shutdown.cancelled() => return,
                    () = tokio::time::sleep(INVENTORY_REFRESH) => {}
                }
                if let Err(e) = agent.inventory.get_all().await {
                    warn!("background inventory refresh: {e}");
                }
            }
        });
        Ok(())
    }

    /// Reverse-order teardown.
    pub async fn stop(&self) {
        if let Err(e) = self.probe_manager.stop_all().await {
            warn!("stopping probes: {e}");
        }
        self.shutdown.cancel();
        info!("agent stopped");
    }
}
