//! Direct-reclaim stall tracer
//!
//! The eBPF object reports tasks that spent longer than a rewritten
//! threshold constant in direct reclaim, carrying the task's cpu CSS
//! address. The tracker-backed inventory turns that address into a
//! container in O(1); events outside any tracked container are dropped.

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use podscope_common::MemoryReclaimEvent;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bpf::{BpfObject, DEFAULT_PER_CPU_BUFFER};
use crate::domain::{ProbeFlags, Result};
use crate::inventory::ContainerInventory;
use crate::probes::{comm_str, ProbeAttr, ProbeContext, ProbeHandler};
use crate::storage::StorageDispatch;

const TRACER_NAME: &str = "memory_reclaim";
const OBJECT: &str = "memory_reclaim_events.o";
const EVENTS_MAP: &str = "reclaim_perf_events";

pub fn probe(ctx: &ProbeContext) -> Result<ProbeAttr> {
    Ok(ProbeAttr::new(
        Arc::new(MemoryReclaimTracer {
            inventory: Arc::clone(&ctx.inventory),
            storage: Arc::clone(&ctx.storage),
            bpf_dir: ctx.bpf_dir.clone(),
            delta_threshold_ns: ctx.memory_reclaim_delta_ns,
        }),
        5,
        ProbeFlags::TRACING,
    ))
}

#[derive(Debug, Serialize)]
struct MemoryReclaimData {
    pid: u64,
    comm: String,
    deltatime: u64,
}

struct MemoryReclaimTracer {
    inventory: Arc<ContainerInventory>,
    storage: Arc<StorageDispatch>,
    bpf_dir: PathBuf,
    delta_threshold_ns: u64,
}

#[async_trait]
impl ProbeHandler for MemoryReclaimTracer {
    async fn start(&self, token: &CancellationToken) -> Result<()> {
        let mut obj = BpfObject::load(
            &self.bpf_dir.join(OBJECT),
            &[("deltath", self.delta_threshold_ns)],
        )?;
        let mut reader = obj.attach_and_event_pipe(EVENTS_MAP, DEFAULT_PER_CPU_BUFFER, token)?;
        obj.wait_detach_by_breaker(token);

        loop {
            let event: MemoryReclaimEvent = reader.read().await?;

            let container = self.inventory.get_by_css(event.css, "cpu").await?;
            // only container workloads matter here
            let Some(container) = container else {
                continue;
            };

            let data = MemoryReclaimData {
                pid: event.pid,
                comm: comm_str(&event.comm),
                deltatime: event.delta_ns,
            };
            info!("{TRACER_NAME} saves storage: {data:?}");

            self.storage
                .save(TRACER_NAME, &container.id, Utc::now(), serde_json::to_value(&data)?)
                .await;
        }
    }
}
