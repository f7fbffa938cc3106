//! Per-CPU software-clock sampler
//!
//! One `PERF_COUNT_SW_CPU_CLOCK` perf event per online CPU, each bound to
//! the same eBPF program and enabled on attach. The whole set is one logical
//! attachment; dropping the sampler closes every event.

use aya::programs::perf_event::{perf_sw_ids, PerfEvent, PerfEventLink, PerfEventScope, PerfTypeId, SamplePolicy};

use crate::domain::Result;

pub struct PerfSampler {
    links: Vec<PerfEventLink>,
}

impl PerfSampler {
    /// Attach the program to every CPU at `sample_freq` Hz.
    ///
    /// Partially created events are dropped (and thereby closed) if any
    /// single attach fails.
    pub fn attach(program: &mut PerfEvent, cpus: &[u32], sample_freq: u64) -> Result<PerfSampler> {
        let mut links = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let link_id = program.attach(
                PerfTypeId::Software,
                perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                PerfEventScope::AllProcessesOneCpu { cpu },
                SamplePolicy::Frequency(sample_freq),
                false,
            )?;
            links.push(program.take_link(link_id)?);
        }
        Ok(PerfSampler { links })
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.links.len()
    }
}
