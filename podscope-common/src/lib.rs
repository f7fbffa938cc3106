#![no_std]

// Shared data structures between the companion eBPF C objects and userspace.
// Field order and widths must match the C side byte for byte; every record is
// read out of a perf ring with a length-checked native-endian copy.

/// Fixed width of kernel task names (`TASK_COMM_LEN`).
pub const TASK_COMM_LEN: usize = 16;

/// Number of cgroup subsystem slots carried per css event.
///
/// Matches `CGROUP_SUBSYS_COUNT` on kernels this agent supports; slots for
/// subsystems that are compiled out stay zero.
pub const CGROUP_SUBSYS_COUNT: usize = 13;

/// Maximum kernfs node name length the css events copy out.
/// Container cgroup directories are 64-char hex ids; two bytes of slack for
/// the NUL and alignment.
pub const KNODE_NAME_LEN: usize = 64 + 2;

/// Cgroup operation types published by the css gather/events objects.
pub const CGROUP_OPS_MKDIR: u64 = 0;
pub const CGROUP_OPS_RMDIR: u64 = 1;

/// One cgroup mkdir/rmdir observation.
///
/// Published to the `cgroup_perf_events` map by both the one-shot gather
/// object and the long-lived events object.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CgroupCssEvent {
    /// Kernel address of the `struct cgroup`.
    pub cgroup: u64,
    /// [`CGROUP_OPS_MKDIR`] or [`CGROUP_OPS_RMDIR`].
    pub ops_type: u64,
    /// Hierarchy id of the cgroup root.
    pub cgroup_root: i32,
    /// Depth of the cgroup below the root.
    pub cgroup_level: i32,
    /// Kernel address of the `cgroup_subsys_state` per subsystem id,
    /// indexed by the order of /proc/cgroups. Zero when absent.
    pub css: [u64; CGROUP_SUBSYS_COUNT],
    /// The cgroup directory name; a container id when kubelet made it.
    pub knode_name: [u8; KNODE_NAME_LEN],
}

/// Deepest kernel stack the probes capture.
pub const STACK_MAX_DEPTH: usize = 127;

/// Record emitted by the softlockup object when the watchdog fires.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SoftLockupEvent {
    pub cpu: i32,
    pub pid: i32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Record emitted by the memory-reclaim object when direct reclaim stalls a
/// task longer than the rewritten `delta_threshold_ns` constant.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemoryReclaimEvent {
    pub comm: [u8; TASK_COMM_LEN],
    /// Time spent in direct reclaim, nanoseconds.
    pub delta_ns: u64,
    /// Kernel address of the task's cpu `cgroup_subsys_state`.
    pub css: u64,
    pub pid: u64,
}

/// Record emitted by the dropwatch object for TCP packet drops.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DropWatchEvent {
    pub tgid_pid: u64,
    /// Addresses and ports in network byte order.
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub queue_mapping: u32,
    pub pkt_len: u64,
    pub stack_size: i64,
    pub stack: [u64; STACK_MAX_DEPTH],
    pub sk_max_ack_backlog: u32,
    pub state: u8,
    pub drop_type: u8,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Drop types published by the dropwatch object.
pub const DROP_TCP_COMMON: u8 = 1;
pub const DROP_TCP_SYN_FLOOD: u8 = 2;
pub const DROP_TCP_LISTEN_OVERFLOW_HANDSHAKE1: u8 = 3;
pub const DROP_TCP_LISTEN_OVERFLOW_HANDSHAKE3: u8 = 4;

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication.
// Pod guarantees the types can be reinterpreted as plain bytes.
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for CgroupCssEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SoftLockupEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for MemoryReclaimEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for DropWatchEvent {}
