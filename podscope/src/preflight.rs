//! Pre-flight checks
//!
//! Validates system requirements before loading eBPF objects, with
//! actionable messages when something is missing.

use anyhow::{bail, Context, Result};
use caps::{CapSet, Capability};
use std::path::Path;

/// Minimum kernel for the probe types this agent attaches.
const MIN_KERNEL_VERSION: (u32, u32) = (4, 18);

/// Run all pre-flight checks before the agent bootstraps.
pub fn run_preflight_checks(bpf_object_dir: &str) -> Result<()> {
    check_capabilities()?;
    check_kernel_version()?;
    check_object_dir(bpf_object_dir)?;
    Ok(())
}

/// The agent needs CAP_BPF/CAP_PERFMON (or CAP_SYS_ADMIN on older kernels).
fn check_capabilities() -> Result<()> {
    let effective =
        caps::read(None, CapSet::Effective).context("failed to read process capabilities")?;

    if effective.contains(&Capability::CAP_SYS_ADMIN) {
        return Ok(());
    }
    for cap in [Capability::CAP_BPF, Capability::CAP_PERFMON] {
        if !effective.contains(&cap) {
            bail!(
                "missing {cap:?}. Grant it with `setcap cap_bpf,cap_perfmon+ep $(command -v podscope)` or run as root."
            );
        }
    }
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read /proc/sys/kernel/osrelease")?;

    let Some(version) = parse_kernel_version(&release) else {
        // unparseable vendor strings pass; the loader will complain if the
        // kernel really cannot do it
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "kernel {}.{} is too old; podscope requires Linux {}.{} or newer for raw tracepoints and perf-event programs (current: {})",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release.trim()
        );
    }
    Ok(())
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

fn check_object_dir(dir: &str) -> Result<()> {
    let path = Path::new(dir);
    if !path.is_dir() {
        bail!(
            "eBPF object directory not found: {dir}\n\n\
             Install the companion objects or point bpf.object_dir at them."
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_version("6.1.0-arch1-1\n"), Some((6, 1)));
        assert_eq!(parse_kernel_version("4"), Some((4, 0)));
        assert_eq!(parse_kernel_version("weird"), None);
    }

    #[test]
    fn test_object_dir_missing() {
        let result = check_object_dir("/nonexistent/bpf");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("object directory not found"));
    }

    #[test]
    fn test_kernel_version_check_runs() {
        // don't assert success, the test may run anywhere; it must not panic
        let _ = check_kernel_version();
    }
}
