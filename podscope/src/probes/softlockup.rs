//! Softlockup watchdog tracer
//!
//! Streams `{cpu, pid, comm}` records from the softlockup eBPF object,
//! captures the locked task's kernel stack, and emits one document per
//! event. Also exposes a `happened` gauge counting events since the last
//! scrape.

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use podscope_common::SoftLockupEvent;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bpf::{BpfObject, DEFAULT_PER_CPU_BUFFER};
use crate::domain::{ProbeFlags, Result};
use crate::metrics::MetricData;
use crate::probes::{comm_str, ProbeAttr, ProbeContext, ProbeHandler};
use crate::storage::StorageDispatch;

const OBJECT: &str = "softlockup.o";
const EVENTS_MAP: &str = "softlockup_perf_events";

pub fn probe(ctx: &ProbeContext) -> Result<ProbeAttr> {
    Ok(ProbeAttr::new(
        Arc::new(SoftLockupTracer {
            storage: Arc::clone(&ctx.storage),
            bpf_dir: ctx.bpf_dir.clone(),
            happened: AtomicU64::new(0),
        }),
        10,
        ProbeFlags::METRIC.union(ProbeFlags::TRACING),
    ))
}

#[derive(Debug, Serialize)]
struct SoftLockupData {
    cpu: i32,
    pid: i32,
    comm: String,
    stack: String,
}

struct SoftLockupTracer {
    storage: Arc<StorageDispatch>,
    bpf_dir: PathBuf,
    happened: AtomicU64,
}

fn pid_stack(pid: i32) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/stack")).unwrap_or_default()
}

#[async_trait]
impl ProbeHandler for SoftLockupTracer {
    async fn start(&self, token: &CancellationToken) -> Result<()> {
        let mut obj = match BpfObject::load(&self.bpf_dir.join(OBJECT), &[]) {
            Ok(obj) => obj,
            Err(e) => {
                info!("failed to load {OBJECT}: {e}");
                return Err(e);
            }
        };

        let mut reader = obj.attach_and_event_pipe(EVENTS_MAP, DEFAULT_PER_CPU_BUFFER, token)?;
        obj.wait_detach_by_breaker(token);

        loop {
            let event: SoftLockupEvent = reader.read().await?;

            let data = SoftLockupData {
                cpu: event.cpu,
                pid: event.pid,
                comm: comm_str(&event.comm),
                stack: pid_stack(event.pid),
            };
            self.happened.fetch_add(1, Ordering::Relaxed);

            self.storage
                .save("softlockup", "", Utc::now(), serde_json::to_value(&data)?)
                .await;
        }
    }

    async fn update(&self) -> Result<Vec<MetricData>> {
        let count = self.happened.swap(0, Ordering::Relaxed);
        Ok(vec![MetricData::gauge("happened", count as f64, "softlockup happened")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comm_str_trims_nul() {
        let mut comm = [0u8; 16];
        comm[..4].copy_from_slice(&b"ksoftirqd"[..4]);
        assert_eq!(comm_str(&comm), "ksof");

        let full = *b"exactly16bytes!!";
        assert_eq!(comm_str(&full), "exactly16bytes!!");
    }

    #[tokio::test]
    async fn test_update_drains_counter() {
        let tracer = SoftLockupTracer {
            storage: Arc::new(crate::storage::StorageDispatch::new(
                Vec::new(),
                Arc::new(crate::inventory::tests_support::offline_inventory()),
                "n",
                "r",
            )),
            bpf_dir: PathBuf::from("/nonexistent"),
            happened: AtomicU64::new(3),
        };

        let points = tracer.update().await.unwrap();
        assert_eq!(points[0].value, 3.0);
        // drained by the scrape
        let points = tracer.update().await.unwrap();
        assert_eq!(points[0].value, 0.0);
    }

    #[tokio::test]
    async fn test_missing_object_fails_current_run() {
        let tracer = SoftLockupTracer {
            storage: Arc::new(crate::storage::StorageDispatch::new(
                Vec::new(),
                Arc::new(crate::inventory::tests_support::offline_inventory()),
                "n",
                "r",
            )),
            bpf_dir: PathBuf::from("/nonexistent"),
            happened: AtomicU64::new(0),
        };
        let err = tracer.start(&CancellationToken::new()).await.unwrap_err();
        assert!(!err.is_quiet_exit());
    }
}
