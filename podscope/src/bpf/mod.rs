//! eBPF object management
//!
//! One [`BpfObject`] per loaded ELF object. The handle owns the kernel-side
//! maps, programs, and attachment links, indexes them by id and by declared
//! name, and hands out per-CPU perf-event readers with cooperative
//! cancellation. Probes load their object at the start of a run and drop it
//! when the run ends; nothing is hot-reloaded.

pub mod object;
pub mod perf;
pub mod sampler;

pub use object::{AttachOption, AttachTarget, BpfObject, MapInfo, ObjectInfo, ProgramInfo};
pub use perf::PerfReader;

use crate::domain::Result;

/// Default per-CPU buffer for probe event pipes, in bytes.
pub const DEFAULT_PER_CPU_BUFFER: usize = 8192;

/// Raise `RLIMIT_MEMLOCK` so map and program allocations are not rejected on
/// kernels that still charge BPF memory against it.
#[allow(unsafe_code)]
pub fn init_bpf_manager() -> Result<()> {
    let limit = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    // SAFETY: setrlimit only reads the provided struct.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
