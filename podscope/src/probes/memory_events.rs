//! Per-container memory.events counters.

use async_trait::async_trait;
use std::sync::Arc;

use crate::cgroups::CgroupReader;
use crate::domain::{ContainerType, ProbeFlags, Result};
use crate::inventory::ContainerInventory;
use crate::metrics::MetricData;
use crate::probes::{ProbeAttr, ProbeContext, ProbeHandler};

pub fn probe(ctx: &ProbeContext) -> Result<ProbeAttr> {
    Ok(ProbeAttr::new(
        Arc::new(MemoryEventsCollector {
            inventory: Arc::clone(&ctx.inventory),
            cgroup: Arc::clone(&ctx.cgroup),
        }),
        0,
        ProbeFlags::METRIC,
    ))
}

struct MemoryEventsCollector {
    inventory: Arc<ContainerInventory>,
    cgroup: Arc<dyn CgroupReader>,
}

#[async_trait]
impl ProbeHandler for MemoryEventsCollector {
    async fn update(&self) -> Result<Vec<MetricData>> {
        let containers = self.inventory.get_by_type(ContainerType::NORMAL).await?;

        let mut metrics = Vec::new();
        for container in containers {
            let raw = self.cgroup.memory_event_raw(&container.cgroup_suffix)?;
            for (key, value) in raw {
                metrics.push(MetricData::container_gauge(
                    &container,
                    &key,
                    value as f64,
                    &format!("memory events {key}"),
                ));
            }
        }
        Ok(metrics)
    }
}
