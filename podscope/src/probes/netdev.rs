//! Network device state events
//!
//! Watches interface flag words and decodes admin/carrier transitions from
//! `(flags, change)` pairs. Transitions count into per-interface gauges and
//! each one emits a document.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{AgentError, ProbeFlags, Result};
use crate::metrics::MetricData;
use crate::probes::{ProbeAttr, ProbeContext, ProbeHandler};
use crate::storage::StorageDispatch;

const IFF_UP: u32 = libc::IFF_UP as u32;
/// `IFF_LOWER_UP` from linux/if.h; libc's constant is for SIOCGIFFLAGS use.
const IFF_LOWER_UP: u32 = 1 << 16;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn probe(ctx: &ProbeContext) -> Result<ProbeAttr> {
    Ok(ProbeAttr::new(
        Arc::new(NetdevTracer {
            storage: Arc::clone(&ctx.storage),
            whitelist: ctx.netdev_whitelist.clone(),
            sysfs: PathBuf::from("/sys/class/net"),
            state: Mutex::new(NetdevState::default()),
        }),
        10,
        ProbeFlags::METRIC.union(ProbeFlags::TRACING),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkStatus {
    AdminUp,
    AdminDown,
    CarrierUp,
    CarrierDown,
}

impl LinkStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::AdminUp => "linkstatus_adminup",
            LinkStatus::AdminDown => "linkstatus_admindown",
            LinkStatus::CarrierUp => "linkstatus_carrierup",
            LinkStatus::CarrierDown => "linkstatus_carrierdown",
        }
    }
}

/// Decode the transitions a flag change represents.
#[must_use]
pub fn flags_to_status(flags: u32, change: u32) -> Vec<LinkStatus> {
    let mut status = Vec::new();
    if change & IFF_UP != 0 {
        status.push(if flags & IFF_UP != 0 { LinkStatus::AdminUp } else { LinkStatus::AdminDown });
    }
    if change & IFF_LOWER_UP != 0 {
        status.push(if flags & IFF_LOWER_UP != 0 {
            LinkStatus::CarrierUp
        } else {
            LinkStatus::CarrierDown
        });
    }
    status
}

#[derive(Default)]
struct NetdevState {
    /// ifname -> last seen flag word.
    flags: HashMap<String, u32>,
    /// (status, ifname) -> transition count.
    counts: HashMap<(LinkStatus, String), u64>,
}

#[derive(Debug, Serialize)]
struct NetdevEventData {
    ifname: String,
    index: i32,
    linkstatus: String,
    mac: String,
    start: bool,
}

struct NetdevTracer {
    storage: Arc<StorageDispatch>,
    whitelist: Vec<String>,
    sysfs: PathBuf,
    state: Mutex<NetdevState>,
}

impl NetdevTracer {
    fn watched(&self, ifname: &str) -> bool {
        if self.whitelist.is_empty() {
            ifname != "lo"
        } else {
            self.whitelist.iter().any(|w| w == ifname)
        }
    }

    fn read_flags(&self, ifname: &str) -> Option<u32> {
        let raw = std::fs::read_to_string(self.sysfs.join(ifname).join("flags")).ok()?;
        let raw = raw.trim();
        u32::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
    }

    fn read_attr(&self, ifname: &str, attr: &str) -> String {
        std::fs::read_to_string(self.sysfs.join(ifname).join(attr))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.sysfs)
            .map_err(|e| AgentError::file(self.sysfs.display().to_string(), e))?;
        Ok(entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| self.watched(name))
            .collect())
    }

    /// Compare current flags against the cache; returns the transitions to
    /// report. New interfaces are cached silently.
    fn sweep(&self) -> Result<Vec<(String, u32, u32)>> {
        let mut changed = Vec::new();
        let mut state = self.state.lock().unwrap();
        for ifname in self.interfaces()? {
            let Some(flags) = self.read_flags(&ifname) else {
                continue;
            };
            match state.flags.insert(ifname.clone(), flags) {
                None => {}
                Some(prev) if prev == flags => {}
                Some(prev) => changed.push((ifname, flags, flags ^ prev)),
            }
        }
        Ok(changed)
    }

    fn record(&self, ifname: &str, statuses: &[LinkStatus]) -> String {
        let mut state = self.state.lock().unwrap();
        let mut rendered = String::new();
        for &status in statuses {
            *state.counts.entry((status, ifname.to_string())).or_insert(0) += 1;
            if !rendered.is_empty() {
                rendered.push_str(", ");
            }
            rendered.push_str(status.as_str());
        }
        rendered
    }
}

#[async_trait]
impl ProbeHandler for NetdevTracer {
    async fn start(&self, token: &CancellationToken) -> Result<()> {
        // seed the flag cache so the first sweep reports nothing
        let _ = self.sweep()?;

        loop {
            tokio::select! {
                () = token.cancelled() => return Err(AgentError::Canceled),
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            for (ifname, flags, change) in self.sweep()? {
                let statuses = flags_to_status(flags, change);
                if statuses.is_empty() {
                    debug!("{ifname}: flag change {change:#x} carries no link transition");
                    continue;
                }
                let linkstatus = self.record(&ifname, &statuses);

                let data = NetdevEventData {
                    index: self.read_attr(&ifname, "ifindex").parse().unwrap_or(-1),
                    mac: self.read_attr(&ifname, "address"),
                    ifname,
                    linkstatus,
                    start: false,
                };
                self.storage
                    .save("netdev_events", "", Utc::now(), serde_json::to_value(&data)?)
                    .await;
            }
        }
    }

    async fn update(&self) -> Result<Vec<MetricData>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .counts
            .iter()
            .map(|((status, ifname), count)| {
                MetricData::gauge(status.as_str(), *count as f64, status.as_str())
                    .with_label("device", ifname)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_transitions() {
        assert_eq!(flags_to_status(IFF_UP, IFF_UP), vec![LinkStatus::AdminUp]);
        assert_eq!(flags_to_status(0, IFF_UP), vec![LinkStatus::AdminDown]);
    }

    #[test]
    fn test_carrier_transitions() {
        assert_eq!(flags_to_status(IFF_LOWER_UP, IFF_LOWER_UP), vec![LinkStatus::CarrierUp]);
        assert_eq!(flags_to_status(0, IFF_LOWER_UP), vec![LinkStatus::CarrierDown]);
    }

    #[test]
    fn test_combined_transition() {
        let statuses = flags_to_status(IFF_UP | IFF_LOWER_UP, IFF_UP | IFF_LOWER_UP);
        assert_eq!(statuses, vec![LinkStatus::AdminUp, LinkStatus::CarrierUp]);
    }

    #[test]
    fn test_no_change_no_status() {
        assert!(flags_to_status(IFF_UP | IFF_LOWER_UP, 0).is_empty());
    }

    /// Applying the decode twice on the same `(flags, prev)` pair yields
    /// identical transition sets.
    #[test]
    fn test_decode_is_pure() {
        let flags = IFF_UP;
        let prev = IFF_UP | IFF_LOWER_UP;
        let once = flags_to_status(flags, flags ^ prev);
        let twice = flags_to_status(flags, flags ^ prev);
        assert_eq!(once, twice);
        assert_eq!(once, vec![LinkStatus::CarrierDown]);
    }

    #[tokio::test]
    async fn test_sweep_detects_flag_change() {
        let dir = tempfile::tempdir().unwrap();
        let eth0 = dir.path().join("eth0");
        std::fs::create_dir_all(&eth0).unwrap();
        std::fs::write(eth0.join("flags"), "0x1003\n").unwrap();
        std::fs::write(eth0.join("ifindex"), "2\n").unwrap();
        std::fs::write(eth0.join("address"), "aa:bb:cc:dd:ee:ff\n").unwrap();

        let tracer = NetdevTracer {
            storage: Arc::new(crate::storage::StorageDispatch::new(
                Vec::new(),
                Arc::new(crate::inventory::tests_support::offline_inventory()),
                "n",
                "r",
            )),
            whitelist: vec!["eth0".to_string()],
            sysfs: dir.path().to_path_buf(),
            state: Mutex::new(NetdevState::default()),
        };

        // first sweep only seeds the cache
        assert!(tracer.sweep().unwrap().is_empty());

        // admin down: 0x1003 -> 0x1002
        std::fs::write(eth0.join("flags"), "0x1002\n").unwrap();
        let changed = tracer.sweep().unwrap();
        assert_eq!(changed.len(), 1);
        let (ifname, flags, change) = &changed[0];
        assert_eq!(ifname, "eth0");
        assert_eq!(flags_to_status(*flags, *change), vec![LinkStatus::AdminDown]);

        // counts show up on the metric side
        tracer.record("eth0", &[LinkStatus::AdminDown]);
        let points = tracer.update().await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 1.0);
        assert_eq!(points[0].labels().get("device").unwrap(), "eth0");
    }
}
