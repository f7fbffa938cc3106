//! Probe registry
//!
//! A probe is a named unit that emits metrics on poll (`update`), streams
//! tracing documents from a long-running `start`, or both. Factories for
//! the built-in probes are instantiated once at agent init; a configured
//! blacklist removes probes by name before anything runs.

pub mod cpu_stat;
pub mod dload;
pub mod dropwatch;
pub mod loadavg;
pub mod manager;
pub mod memory_events;
pub mod memory_reclaim;
pub mod netdev;
pub mod softlockup;

pub use manager::{ProbeInfo, ProbeManager};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cgroups::CgroupReader;
use crate::domain::{AgentError, ProbeFlags, Result};
use crate::inventory::ContainerInventory;
use crate::metrics::MetricData;
use crate::storage::StorageDispatch;

/// Everything a probe may need, threaded in at construction instead of
/// living in globals.
pub struct ProbeContext {
    pub inventory: Arc<ContainerInventory>,
    pub storage: Arc<StorageDispatch>,
    pub cgroup: Arc<dyn CgroupReader>,
    /// Directory holding the companion eBPF objects.
    pub bpf_dir: PathBuf,
    /// Interfaces the netdev probe watches; empty watches everything but
    /// loopback.
    pub netdev_whitelist: Vec<String>,
    /// D-load level above which the dload probe captures stacks.
    pub dload_threshold: f64,
    /// Direct-reclaim stall threshold rewritten into the reclaim object.
    pub memory_reclaim_delta_ns: u64,
}

/// One probe's behavior. Metric probes override [`ProbeHandler::update`],
/// tracing probes [`ProbeHandler::start`]; a probe may do both.
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    /// Long-running event pump. Cancelled through `token`; returning
    /// [`AgentError::NotSupported`] parks the probe permanently.
    async fn start(&self, token: &CancellationToken) -> Result<()> {
        let _ = token;
        Err(AgentError::NotSupported)
    }

    /// Produce the current metric data points.
    async fn update(&self) -> Result<Vec<MetricData>> {
        Ok(Vec::new())
    }
}

#[derive(Clone)]
pub struct ProbeAttr {
    pub handler: Arc<dyn ProbeHandler>,
    /// Seconds between restarts of `start`.
    pub interval_secs: u64,
    pub flags: ProbeFlags,
}

impl ProbeAttr {
    #[must_use]
    pub fn new(handler: Arc<dyn ProbeHandler>, interval_secs: u64, flags: ProbeFlags) -> ProbeAttr {
        ProbeAttr { handler, interval_secs, flags }
    }
}

pub type ProbeFactory = fn(&ProbeContext) -> Result<ProbeAttr>;

/// Kernel task name out of a fixed NUL-padded record field.
pub(crate) fn comm_str(comm: &[u8]) -> String {
    let len = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..len]).into_owned()
}

/// The probes this agent ships.
fn builtin() -> &'static [(&'static str, ProbeFactory)] {
    &[
        ("loadavg", loadavg::probe),
        ("cpu_stat", cpu_stat::probe),
        ("memory_events", memory_events::probe),
        ("softlockup", softlockup::probe),
        ("dload", dload::probe),
        ("netdev_events", netdev::probe),
        ("dropwatch", dropwatch::probe),
        ("memory_reclaim", memory_reclaim::probe),
    ]
}

pub struct ProbeRegistry {
    probes: HashMap<String, ProbeAttr>,
    blacklist: Vec<String>,
}

impl ProbeRegistry {
    #[must_use]
    pub fn new(blacklist: &[String]) -> ProbeRegistry {
        ProbeRegistry { probes: HashMap::new(), blacklist: blacklist.to_vec() }
    }

    /// Instantiate every built-in factory not on the blacklist.
    pub fn build(ctx: &ProbeContext, blacklist: &[String]) -> Result<ProbeRegistry> {
        let mut registry = ProbeRegistry::new(blacklist);
        for (name, factory) in builtin() {
            if registry.blacklist.iter().any(|b| b == name) {
                continue;
            }
            let attr = factory(ctx)?;
            if !attr.flags.is_valid() {
                return Err(AgentError::InvalidArgs(format!("probe {name}: invalid flag")));
            }
            registry.probes.insert((*name).to_string(), attr);
        }
        Ok(registry)
    }

    /// Used by tests and by code that assembles custom registries.
    pub fn insert(&mut self, name: &str, attr: ProbeAttr) {
        self.probes.insert(name.to_string(), attr);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProbeAttr> {
        self.probes.get(name)
    }

    /// Probes carrying the metric flag.
    #[must_use]
    pub fn metric_probes(&self) -> Vec<(String, Arc<dyn ProbeHandler>)> {
        self.probes
            .iter()
            .filter(|(_, attr)| attr.flags.contains(ProbeFlags::METRIC))
            .map(|(name, attr)| (name.clone(), Arc::clone(&attr.handler)))
            .collect()
    }

    /// Probes carrying the tracing flag, for the scheduler.
    #[must_use]
    pub fn tracing_probes(&self) -> Vec<(String, ProbeAttr)> {
        self.probes
            .iter()
            .filter(|(_, attr)| attr.flags.contains(ProbeFlags::TRACING))
            .map(|(name, attr)| (name.clone(), attr.clone()))
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.probes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ProbeHandler for Noop {}

    #[test]
    fn test_registry_filters_by_flag() {
        let mut registry = ProbeRegistry::new(&[]);
        registry.insert("m", ProbeAttr::new(Arc::new(Noop), 0, ProbeFlags::METRIC));
        registry.insert("t", ProbeAttr::new(Arc::new(Noop), 10, ProbeFlags::TRACING));
        registry.insert(
            "both",
            ProbeAttr::new(Arc::new(Noop), 10, ProbeFlags::METRIC.union(ProbeFlags::TRACING)),
        );

        let metric_names: Vec<String> =
            registry.metric_probes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(metric_names.len(), 2);
        assert!(metric_names.contains(&"m".to_string()));
        assert!(metric_names.contains(&"both".to_string()));

        let tracing_names: Vec<String> =
            registry.tracing_probes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(tracing_names.len(), 2);
        assert!(tracing_names.contains(&"t".to_string()));
    }

    #[tokio::test]
    async fn test_default_start_is_not_supported() {
        let noop = Noop;
        let err = noop.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::NotSupported));
        assert!(noop.update().await.unwrap().is_empty());
    }
}
