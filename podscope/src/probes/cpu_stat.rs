//! Per-container CPU throttling and wait-rate metrics
//!
//! Tracks deltas of `cpu.stat` counters and cpuacct usage between updates.
//! Each container keeps its own previous sample through a life resource, so
//! state follows the container's lifecycle and never leaks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::cgroups::CgroupReader;
use crate::domain::{ContainerType, ProbeFlags, Result};
use crate::inventory::ContainerInventory;
use crate::metrics::MetricData;
use crate::probes::{ProbeAttr, ProbeContext, ProbeHandler};

const LIFE_KEY: &str = "collector_cpu_stat";

/// Minimum spacing between two delta computations for one container.
const MIN_UPDATE_NANOS: i64 = 1_000_000_000;

pub fn probe(ctx: &ProbeContext) -> Result<ProbeAttr> {
    ctx.inventory.register_life_resource(
        LIFE_KEY,
        Arc::new(|| Arc::new(CpuStatState::default()) as Arc<dyn Any + Send + Sync>),
    )?;
    Ok(ProbeAttr::new(
        Arc::new(CpuStatCollector {
            inventory: Arc::clone(&ctx.inventory),
            cgroup: Arc::clone(&ctx.cgroup),
        }),
        0,
        ProbeFlags::METRIC,
    ))
}

#[derive(Debug, Clone, Copy, Default)]
struct CpuStatSample {
    nr_throttled: u64,
    throttled_time: u64,
    nr_bursts: u64,
    burst_time: u64,
    hierarchy_wait_sum: u64,
    inner_wait_sum: u64,
    cpu_total: u64,

    waitrate_hierarchy: f64,
    waitrate_inner: f64,
    waitrate_exter: f64,
    waitrate_throttled: f64,
}

#[derive(Default)]
pub struct CpuStatState {
    inner: Mutex<(CpuStatSample, Option<DateTime<Utc>>)>,
}

struct CpuStatCollector {
    inventory: Arc<ContainerInventory>,
    cgroup: Arc<dyn CgroupReader>,
}

/// Compute the new sample from raw counters and the previous sample.
fn advance(prev: &CpuStatSample, raw: &std::collections::HashMap<String, u64>, cpu_total: u64) -> CpuStatSample {
    let mut stat = CpuStatSample {
        nr_throttled: raw.get("nr_throttled").copied().unwrap_or(0),
        throttled_time: raw.get("throttled_time").copied().unwrap_or(0),
        hierarchy_wait_sum: raw.get("hierarchy_wait_sum").copied().unwrap_or(0),
        inner_wait_sum: raw.get("inner_wait_sum").copied().unwrap_or(0),
        nr_bursts: raw.get("nr_bursts").copied().unwrap_or(0),
        burst_time: raw.get("burst_time").copied().unwrap_or(0),
        cpu_total,
        ..CpuStatSample::default()
    };

    let mut delta_hierarchy = stat.hierarchy_wait_sum.saturating_sub(prev.hierarchy_wait_sum);
    let mut delta_throttled = 0;
    let mut delta_inner = 0;
    let mut delta_exter = 0;
    if delta_hierarchy > 0 {
        delta_throttled = stat.throttled_time.saturating_sub(prev.throttled_time);
        delta_inner = stat.inner_wait_sum.saturating_sub(prev.inner_wait_sum);
        if delta_hierarchy < delta_throttled + delta_inner {
            delta_hierarchy = delta_throttled + delta_inner;
        }
        delta_exter = delta_hierarchy - delta_throttled - delta_inner;
    }

    let delta_wait_run = delta_hierarchy + stat.cpu_total.saturating_sub(prev.cpu_total);
    if delta_wait_run != 0 {
        let total = delta_wait_run as f64;
        stat.waitrate_hierarchy = delta_hierarchy as f64 * 100.0 / total;
        stat.waitrate_inner = delta_inner as f64 * 100.0 / total;
        stat.waitrate_exter = delta_exter as f64 * 100.0 / total;
        stat.waitrate_throttled = delta_throttled as f64 * 100.0 / total;
    }

    stat
}

impl CpuStatCollector {
    fn refresh_container(&self, state: &CpuStatState, suffix: &str) -> Result<CpuStatSample> {
        let mut guard = state.inner.lock().unwrap();
        let (prev, last_update) = &mut *guard;

        let now = Utc::now();
        if let Some(last) = last_update {
            if (now - *last).num_nanoseconds().unwrap_or(i64::MAX) < MIN_UPDATE_NANOS {
                return Ok(*prev);
            }
        }

        let raw = self.cgroup.cpu_stat_raw(suffix)?;
        let usage = self.cgroup.cpu_usage(suffix)?;

        let next = advance(prev, &raw, usage.usage);
        *prev = next;
        *last_update = Some(now);
        Ok(next)
    }
}

#[async_trait]
impl ProbeHandler for CpuStatCollector {
    async fn update(&self) -> Result<Vec<MetricData>> {
        let containers = self
            .inventory
            .get_by_type(ContainerType::NORMAL.union(ContainerType::SIDECAR))
            .await?;

        let mut metrics = Vec::new();
        for container in containers {
            let Some(state) = container.life_resource::<CpuStatState>(LIFE_KEY) else {
                continue;
            };
            let sample = match self.refresh_container(&state, &container.cgroup_suffix) {
                Ok(sample) => sample,
                Err(e) => {
                    info!("failed to update cpu info of {container}, {e}");
                    continue;
                }
            };

            metrics.extend([
                MetricData::container_gauge(&container, "wait_rate", sample.waitrate_hierarchy, "wait rate for containers"),
                MetricData::container_gauge(&container, "inner_wait_rate", sample.waitrate_inner, "inner wait rate for container"),
                MetricData::container_gauge(&container, "exter_wait_rate", sample.waitrate_exter, "exter wait rate for container"),
                MetricData::container_gauge(&container, "throttle_wait_rate", sample.waitrate_throttled, "throttle wait rate for container"),
                MetricData::container_gauge(&container, "nr_throttled", sample.nr_throttled as f64, "throttle nr for container"),
                MetricData::container_gauge(&container, "nr_bursts", sample.nr_bursts as f64, "burst nr for container"),
                MetricData::container_gauge(&container, "burst_time", sample.burst_time as f64, "burst time for container"),
            ]);
        }

        Ok(metrics)
    }
}
