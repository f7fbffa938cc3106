//! Cgroup-CSS tracker
//!
//! Live mapping from kernel `cgroup_subsys_state` addresses to container-id
//! guesses (the cgroup directory name). Populated by two companion eBPF
//! objects: a one-shot "gather" object drained during bootstrap, where a
//! walk over existing container cgroup directories triggers one observation
//! per cgroup, and a long-lived "events" object that follows mkdir/rmdir
//! for the rest of the process lifetime.

use log::{debug, error, info};
use podscope_common::{CgroupCssEvent, CGROUP_OPS_MKDIR, CGROUP_OPS_RMDIR};
use regex::Regex;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bpf::{BpfObject, PerfReader, DEFAULT_PER_CPU_BUFFER};
use crate::cgroups;
use crate::domain::Result;

const GATHER_OBJECT: &str = "cgroup_css_gather.o";
const EVENTS_OBJECT: &str = "cgroup_css_events.o";
const EVENTS_MAP: &str = "cgroup_perf_events";

/// Container cgroup directories are 64-char hex ids.
const CONTAINER_KNODE_LEN: usize = 64;

/// Reading this file inside a cgroup directory makes the gather object emit
/// an observation for it.
const NOTIFY_FILE: &str = "cgroup.clone_children";

/// Subsystems whose v1 roots are walked during bootstrap.
const WALK_SUBSYS: &[&str] = &["cpu", "cpuacct", "cpuset", "memory", "blkio"];

/// How long bootstrap waits for gather events to drain.
const GATHER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CssEntry {
    pub css: u64,
    pub subsys: String,
    pub cgroup: u64,
    pub cgroup_root: i32,
    pub cgroup_level: i32,
    pub container_id: String,
}

pub struct CssTracker {
    /// css address -> entry; last write wins, rmdir removes regardless of
    /// ordering with respect to the matching mkdir.
    entries: RwLock<HashMap<u64, CssEntry>>,
    /// Subsystem names in /proc/cgroups order; the index is the kernel's
    /// subsystem id.
    subsys_names: Vec<String>,
    knode_regex: Regex,
    /// The long-lived events object; kept so the kernel side stays attached.
    events_object: Mutex<Option<BpfObject>>,
    bpf_dir: PathBuf,
}

impl CssTracker {
    /// Read the subsystem id order from /proc/cgroups and prepare an empty
    /// tracker.
    pub fn new(bpf_dir: impl Into<PathBuf>) -> Result<CssTracker> {
        let file = std::fs::File::open("/proc/cgroups");
        let subsys_names = match file {
            Ok(f) => parse_proc_cgroups(std::io::BufReader::new(f)),
            Err(e) => {
                debug!("/proc/cgroups unavailable: {e}");
                Vec::new()
            }
        };
        Ok(Self::with_subsystems(bpf_dir, subsys_names))
    }

    /// Tracker with a fixed subsystem order, for tests.
    #[must_use]
    pub fn with_subsystems(bpf_dir: impl Into<PathBuf>, subsys_names: Vec<String>) -> CssTracker {
        CssTracker {
            entries: RwLock::new(HashMap::new()),
            subsys_names,
            knode_regex: Regex::new("^[a-zA-Z0-9]+$").expect("static regex"),
            events_object: Mutex::new(None),
            bpf_dir: bpf_dir.into(),
        }
    }

    /// Bootstrap the tracker: drain existing cgroups through the gather
    /// object, then leave the events object attached for live updates.
    pub async fn bootstrap(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        self.gather_existing(token).await?;
        self.start_event_stream(token)?;
        info!("css tracker bootstrapped: {} entries", self.entries.read().unwrap().len());
        Ok(())
    }

    /// One-shot pass over cgroups that already exist.
    async fn gather_existing(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let mut gather = BpfObject::load(&self.bpf_dir.join(GATHER_OBJECT), &[])?;
        let gather_token = token.child_token();
        let reader = gather.attach_and_event_pipe(EVENTS_MAP, DEFAULT_PER_CPU_BUFFER, &gather_token)?;
        self.spawn_consumer(reader);

        // give the consumer a beat before triggering observations
        tokio::time::sleep(Duration::from_millis(100)).await;
        notify_existing_cgroups();

        tokio::time::sleep(GATHER_DRAIN).await;
        gather_token.cancel();
        drop(gather);
        Ok(())
    }

    /// Attach the long-lived events object.
    fn start_event_stream(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let mut events = BpfObject::load(&self.bpf_dir.join(EVENTS_OBJECT), &[])?;
        let reader = events.attach_and_event_pipe(EVENTS_MAP, DEFAULT_PER_CPU_BUFFER, token)?;
        self.spawn_consumer(reader);
        *self.events_object.lock().unwrap() = Some(events);
        Ok(())
    }

    fn spawn_consumer(self: &Arc<Self>, mut reader: PerfReader) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match reader.read::<CgroupCssEvent>().await {
                    Ok(event) => tracker.handle_event(&event),
                    Err(e) => {
                        if !e.is_canceled() {
                            error!("css event stream: {e}");
                        }
                        return;
                    }
                }
            }
        });
    }

    pub(crate) fn handle_event(&self, event: &CgroupCssEvent) {
        match event.ops_type {
            CGROUP_OPS_MKDIR => self.update_entries(event),
            CGROUP_OPS_RMDIR => self.delete_entries(event),
            other => error!("css event: unknown ops type {other}"),
        }
    }

    fn update_entries(&self, event: &CgroupCssEvent) {
        let Some(container_id) = self.knode_name(event) else {
            return;
        };

        let mut entries = self.entries.write().unwrap();
        for (index, &css) in event.css.iter().enumerate() {
            if css == 0 {
                continue;
            }
            let Some(subsys) = self.subsys_names.get(index) else {
                continue;
            };
            let entry = CssEntry {
                css,
                subsys: subsys.clone(),
                cgroup: event.cgroup,
                cgroup_root: event.cgroup_root,
                cgroup_level: event.cgroup_level,
                container_id: container_id.clone(),
            };
            debug!("css update: {entry:?}");
            entries.insert(css, entry);
        }
    }

    fn delete_entries(&self, event: &CgroupCssEvent) {
        if self.knode_name(event).is_none() {
            return;
        }

        let mut entries = self.entries.write().unwrap();
        for (index, &css) in event.css.iter().enumerate() {
            if css == 0 || index >= self.subsys_names.len() {
                continue;
            }
            if let Some(old) = entries.remove(&css) {
                debug!("css delete: {old:?}");
            }
        }
    }

    /// The directory name, when it is shaped like a container id.
    fn knode_name(&self, event: &CgroupCssEvent) -> Option<String> {
        let len = event.knode_name.iter().position(|&b| b == 0).unwrap_or(event.knode_name.len());
        let name = std::str::from_utf8(&event.knode_name[..len]).ok()?;
        (!name.is_empty() && self.knode_regex.is_match(name)).then(|| name.to_string())
    }

    /// All entries whose inferred container id matches. Linear scan; the map
    /// is on the order of subsystems x containers.
    #[must_use]
    pub fn list_by_container(&self, container_id: &str) -> Vec<CssEntry> {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.container_id == container_id)
            .cloned()
            .collect()
    }

    /// Subsystem name -> css address for one container.
    #[must_use]
    pub fn css_for_container(&self, container_id: &str) -> HashMap<String, u64> {
        self.list_by_container(container_id)
            .into_iter()
            .map(|e| (e.subsys, e.css))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

fn parse_proc_cgroups<R: BufRead>(reader: R) -> Vec<String> {
    reader
        .lines()
        .map_while(std::result::Result::ok)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next().map(str::to_string))
        .collect()
}

/// Walk the v1 subsystem roots and read the notify file inside every
/// directory whose name has the container-id shape, so the gather object
/// emits one observation per container cgroup.
fn notify_existing_cgroups() {
    let mut seen_roots = Vec::new();
    for subsys in WALK_SUBSYS {
        let root = cgroups::rootfs_path(subsys);
        let Ok(real_root) = std::fs::canonicalize(&root) else {
            continue;
        };
        if seen_roots.contains(&real_root) {
            continue;
        }
        seen_roots.push(real_root.clone());
        walk_notify(&real_root);
    }
}

fn walk_notify(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name.len() == CONTAINER_KNODE_LEN {
            let notify = path.join(NOTIFY_FILE);
            let _ = std::fs::read(&notify);
            debug!("css notify read: {}", notify.display());
            // container cgroups have no nested containers
            continue;
        }
        walk_notify(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podscope_common::{CGROUP_SUBSYS_COUNT, KNODE_NAME_LEN};

    fn tracker() -> CssTracker {
        CssTracker::with_subsystems(
            "/tmp",
            vec!["cpuset".into(), "cpu".into(), "cpuacct".into(), "memory".into(), "blkio".into()],
        )
    }

    fn event(ops: u64, name: &str, css: &[(usize, u64)]) -> CgroupCssEvent {
        let mut knode_name = [0u8; KNODE_NAME_LEN];
        knode_name[..name.len()].copy_from_slice(name.as_bytes());
        let mut css_array = [0u64; CGROUP_SUBSYS_COUNT];
        for &(index, addr) in css {
            css_array[index] = addr;
        }
        CgroupCssEvent {
            cgroup: 0xffff_8880_0000_1000,
            ops_type: ops,
            cgroup_root: 1,
            cgroup_level: 4,
            css: css_array,
            knode_name,
        }
    }

    const ID: &str = "3fb6f7d29f9c4b1c8a3a9a4c4f1f0f8e0f3b2a1c0d9e8f7a6b5c4d3e2f1a0b9c";

    #[test]
    fn test_mkdir_populates_by_subsystem_index() {
        let t = tracker();
        t.handle_event(&event(CGROUP_OPS_MKDIR, ID, &[(1, 0x1000), (3, 0x2000)]));

        assert_eq!(t.len(), 2);
        let css = t.css_for_container(ID);
        assert_eq!(css.get("cpu"), Some(&0x1000));
        assert_eq!(css.get("memory"), Some(&0x2000));
    }

    #[test]
    fn test_rmdir_removes_entries() {
        let t = tracker();
        t.handle_event(&event(CGROUP_OPS_MKDIR, ID, &[(1, 0x1000)]));
        t.handle_event(&event(CGROUP_OPS_RMDIR, ID, &[(1, 0x1000)]));
        assert!(t.is_empty());
    }

    #[test]
    fn test_rmdir_before_mkdir_is_idempotent() {
        let t = tracker();
        t.handle_event(&event(CGROUP_OPS_RMDIR, ID, &[(1, 0x1000)]));
        assert!(t.is_empty());
    }

    #[test]
    fn test_non_container_knode_ignored() {
        let t = tracker();
        t.handle_event(&event(CGROUP_OPS_MKDIR, "system.slice", &[(1, 0x1000)]));
        assert!(t.is_empty());
    }

    #[test]
    fn test_last_write_wins_per_css() {
        let t = tracker();
        t.handle_event(&event(CGROUP_OPS_MKDIR, ID, &[(1, 0x1000)]));
        let other = "b".repeat(64);
        t.handle_event(&event(CGROUP_OPS_MKDIR, &other, &[(1, 0x1000)]));
        assert_eq!(t.len(), 1);
        assert!(t.css_for_container(ID).is_empty());
        assert_eq!(t.css_for_container(&other).get("cpu"), Some(&0x1000));
    }

    #[test]
    fn test_parse_proc_cgroups() {
        let content = "#subsys_name\thierarchy\tnum_cgroups\tenabled\n\
                       cpuset\t2\t10\t1\n\
                       cpu\t3\t50\t1\n\
                       memory\t4\t60\t1\n";
        let names = parse_proc_cgroups(content.as_bytes());
        assert_eq!(names, vec!["cpuset", "cpu", "memory"]);
    }
}
