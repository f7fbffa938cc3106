//! Container cgroup suffix computation
//!
//! The suffix is the path fragment below the cgroup root identifying one
//! container; its shape depends on the pod's QoS class and on kubelet's
//! cgroup driver. Under the systemd driver the slash-delimited path becomes
//! an expanded slice chain and the container id itself is omitted from the
//! last component.

use crate::domain::ContainerQos;

const SYSTEMD_SUFFIX: &str = ".slice";
const NODE_CGROUP_NAME: &str = "kubepods";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
}

impl CgroupDriver {
    #[must_use]
    pub fn from_name(name: &str) -> CgroupDriver {
        if name == "systemd" {
            CgroupDriver::Systemd
        } else {
            CgroupDriver::Cgroupfs
        }
    }
}

/// `{kubepods, burstable, pod<uid>[, <container id>]}`
fn path_components(
    container_id: &str,
    pod_uid: &str,
    qos: ContainerQos,
    driver: CgroupDriver,
) -> Vec<String> {
    let mut parts = vec![NODE_CGROUP_NAME.to_string()];
    if qos != ContainerQos::Guaranteed {
        parts.push(qos.as_str().to_lowercase());
    }
    parts.push(format!("pod{pod_uid}"));
    if driver != CgroupDriver::Systemd {
        parts.push(container_id.to_string());
    }
    parts
}

/// systemd escapes `-` inside a component because it is the hierarchy
/// separator.
fn escape_systemd(part: &str) -> String {
    part.replace('-', "_")
}

/// `test-a-b.slice` becomes `/test.slice/test-a.slice/test-a-b.slice`.
fn expand_systemd_slice(slice: &str) -> String {
    let name = slice.strip_suffix(SYSTEMD_SUFFIX).unwrap_or(slice);

    let mut path = String::new();
    let mut prefix = String::new();
    for component in name.split('-') {
        path.push('/');
        path.push_str(&prefix);
        path.push_str(component);
        path.push_str(SYSTEMD_SUFFIX);
        prefix.push_str(component);
        prefix.push('-');
    }
    path
}

/// Join components into the systemd slice expansion.
fn to_systemd(components: &[String]) -> String {
    let escaped: Vec<String> = components.iter().map(|p| escape_systemd(p)).collect();
    expand_systemd_slice(&(escaped.join("-") + SYSTEMD_SUFFIX))
}

fn to_cgroupfs(components: &[String]) -> String {
    format!("/{}", components.join("/"))
}

/// The container's path below the host cgroup root.
#[must_use]
pub fn container_cgroup_suffix(
    driver: CgroupDriver,
    container_id: &str,
    pod_uid: &str,
    qos: ContainerQos,
) -> String {
    let components = path_components(container_id, pod_uid, qos, driver);
    match driver {
        CgroupDriver::Systemd => to_systemd(&components),
        CgroupDriver::Cgroupfs => to_cgroupfs(&components),
    }
}

/// Convert a slash-delimited pod cgroup path into its systemd slice
/// expansion.
#[must_use]
pub fn cgroupfs_to_systemd(path: &str) -> String {
    let components: Vec<String> =
        path.split('/').filter(|c| !c.is_empty()).map(|c| c.to_string()).collect();
    to_systemd(&components)
}

/// Inverse of [`cgroupfs_to_systemd`] for well-formed pod paths: take the
/// deepest slice, split its hierarchy components, and undo the escaping.
#[must_use]
pub fn systemd_to_cgroupfs(expanded: &str) -> String {
    let Some(last) = expanded.split('/').filter(|c| !c.is_empty()).next_back() else {
        return String::from("/");
    };
    let name = last.strip_suffix(SYSTEMD_SUFFIX).unwrap_or(last);
    let components: Vec<String> = name.split('-').map(|c| c.replace('_', "-")).collect();
    format!("/{}", components.join("/"))
}
