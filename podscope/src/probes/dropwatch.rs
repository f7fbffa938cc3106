//! TCP packet-drop tracer
//!
//! Streams drop records with a raw kernel stack, renders the stack through
//! the kallsyms cache, filters a handful of known-benign drop paths, and
//! emits one document per remaining drop.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use podscope_common::{
    DropWatchEvent, DROP_TCP_COMMON, DROP_TCP_LISTEN_OVERFLOW_HANDSHAKE1,
    DROP_TCP_LISTEN_OVERFLOW_HANDSHAKE3, DROP_TCP_SYN_FLOOD,
};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bpf::{BpfObject, DEFAULT_PER_CPU_BUFFER};
use crate::domain::{ProbeFlags, Result};
use crate::probes::{comm_str, ProbeAttr, ProbeContext, ProbeHandler};
use crate::storage::StorageDispatch;
use crate::symbols::{kernel_symbols, STACK_MAX_DEPTH};

const TRACER_NAME: &str = "dropwatch";
const OBJECT: &str = "dropwatch.o";
const EVENTS_MAP: &str = "perf_events";

// from include/net/tcp_states.h
const TCP_STATES: &[&str] = &[
    "<nil>",
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
    "NEW_SYN_RECV",
];

pub fn probe(ctx: &ProbeContext) -> Result<ProbeAttr> {
    Ok(ProbeAttr::new(
        Arc::new(DropWatchTracer {
            storage: Arc::clone(&ctx.storage),
            bpf_dir: ctx.bpf_dir.clone(),
        }),
        10,
        ProbeFlags::TRACING,
    ))
}

#[derive(Debug, Serialize)]
struct DropWatchData {
    #[serde(rename = "type")]
    drop_type: String,
    comm: String,
    pid: u64,
    saddr: String,
    daddr: String,
    sport: u16,
    dport: u16,
    max_ack_backlog: u32,
    seq: u32,
    ack_seq: u32,
    queue_mapping: u32,
    pkt_len: u64,
    state: String,
    stack: String,
}

struct DropWatchTracer {
    storage: Arc<StorageDispatch>,
    bpf_dir: PathBuf,
}

fn drop_type_str(drop_type: u8) -> &'static str {
    match drop_type {
        DROP_TCP_COMMON => "common_drop",
        DROP_TCP_SYN_FLOOD => "syn_flood",
        DROP_TCP_LISTEN_OVERFLOW_HANDSHAKE1 => "listen_overflow_handshake1",
        DROP_TCP_LISTEN_OVERFLOW_HANDSHAKE3 => "listen_overflow_handshake3",
        _ => "unknown",
    }
}

fn format_event(event: &DropWatchEvent) -> DropWatchData {
    let stack = kernel_symbols().render_stack(&event.stack, STACK_MAX_DEPTH).join("\n");

    DropWatchData {
        drop_type: drop_type_str(event.drop_type).to_string(),
        comm: comm_str(&event.comm),
        pid: event.tgid_pid >> 32,
        saddr: Ipv4Addr::from(u32::from_be(event.saddr)).to_string(),
        daddr: Ipv4Addr::from(u32::from_be(event.daddr)).to_string(),
        sport: u16::from_be(event.sport),
        dport: u16::from_be(event.dport),
        max_ack_backlog: event.sk_max_ack_backlog,
        seq: u32::from_be(event.seq),
        ack_seq: u32::from_be(event.ack_seq),
        queue_mapping: event.queue_mapping,
        pkt_len: event.pkt_len,
        state: TCP_STATES.get(event.state as usize).copied().unwrap_or("<nil>").to_string(),
        stack,
    }
}

/// Known-benign drop paths that would otherwise flood the index.
fn ignore(data: &DropWatchData) -> bool {
    if data.drop_type == "common_drop" && data.state == "CLOSE_WAIT" {
        return true;
    }
    let frames: Vec<&str> = data.stack.lines().collect();
    if frames.len() >= 3
        && (frames[2].starts_with("skb_rbtree_purge/") || frames[2].starts_with("neigh_invalidate/"))
    {
        return true;
    }
    false
}

#[async_trait]
impl ProbeHandler for DropWatchTracer {
    async fn start(&self, token: &CancellationToken) -> Result<()> {
        let mut obj = BpfObject::load(&self.bpf_dir.join(OBJECT), &[])?;
        let mut reader = obj.attach_and_event_pipe(EVENTS_MAP, DEFAULT_PER_CPU_BUFFER, token)?;
        obj.wait_detach_by_breaker(token);

        loop {
            let event: DropWatchEvent = reader.read().await?;
            let data = format_event(&event);

            if ignore(&data) {
                debug!("{TRACER_NAME}: ignore {data:?}");
                continue;
            }

            self.storage
                .save(TRACER_NAME, "", Utc::now(), serde_json::to_value(&data)?)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(state: u8, drop_type: u8) -> DropWatchEvent {
        let mut comm = [0u8; 16];
        comm[..4].copy_from_slice(b"sshd");
        DropWatchEvent {
            tgid_pid: (4242u64 << 32) | 4243,
            saddr: u32::to_be(0x0a00_0001), // 10.0.0.1
            daddr: u32::to_be(0x0a00_0002),
            sport: u16::to_be(22),
            dport: u16::to_be(50000),
            seq: u32::to_be(7),
            ack_seq: u32::to_be(8),
            queue_mapping: 1,
            pkt_len: 52,
            stack_size: 0,
            stack: [0u64; STACK_MAX_DEPTH],
            sk_max_ack_backlog: 128,
            state,
            drop_type,
            comm,
        }
    }

    #[test]
    fn test_format_event_decodes_byte_order() {
        let data = format_event(&event(1, DROP_TCP_COMMON));
        assert_eq!(data.saddr, "10.0.0.1");
        assert_eq!(data.daddr, "10.0.0.2");
        assert_eq!(data.sport, 22);
        assert_eq!(data.dport, 50000);
        assert_eq!(data.pid, 4242);
        assert_eq!(data.comm, "sshd");
        assert_eq!(data.state, "ESTABLISHED");
        assert_eq!(data.drop_type, "common_drop");
    }

    #[test]
    fn test_close_wait_common_drop_ignored() {
        let data = format_event(&event(8, DROP_TCP_COMMON));
        assert_eq!(data.state, "CLOSE_WAIT");
        assert!(ignore(&data));

        let kept = format_event(&event(1, DROP_TCP_SYN_FLOOD));
        assert!(!ignore(&kept));
    }

    #[test]
    fn test_unknown_state_and_type() {
        let data = format_event(&event(200, 99));
        assert_eq!(data.state, "<nil>");
        assert_eq!(data.drop_type, "unknown");
    }
}
