//! Loading, attaching, and map access for a single eBPF object
//!
//! The attach contract is encoded in ELF section names:
//!
//! - `tracepoint/<system>/<symbol>`, link key `<system>/<symbol>`
//! - `kprobe/<symbol>[+<offset>]`, link key `<symbol>+<offset>`
//! - `kretprobe/<symbol>`, link key `<symbol>`
//! - `raw_tracepoint/<symbol>`, link key `<symbol>`
//! - `perf_event` programs attach through [`AttachTarget::PerfEvent`] only
//!
//! A link key may appear at most once per program; a failing attach rolls
//! back every link the same call created.

use aya::maps::MapData;
use aya::programs::{KProbe, PerfEvent, Program, RawTracePoint, TracePoint};
use aya::util::online_cpus;
use aya::{Ebpf, EbpfLoader, Pod};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use object::{Object as _, ObjectSection, ObjectSymbol};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bpf::perf::PerfReader;
use crate::bpf::sampler::PerfSampler;
use crate::domain::{AgentError, Result};

/// How often the detach breaker re-checks that the kernel still holds our
/// programs.
const BREAKER_INTERVAL: Duration = Duration::from_secs(10);

/// Owned attachment link, detached when dropped.
enum OwnedLink {
    TracePoint(aya::programs::trace_point::TracePointLink),
    KProbe(aya::programs::kprobe::KProbeLink),
    RawTracePoint(aya::programs::raw_trace_point::RawTracePointLink),
}

struct MapSpec {
    name: String,
    max_entries: u32,
}

struct ProgramSpec {
    name: String,
    section: String,
    links: HashMap<String, OwnedLink>,
}

/// Attach target for [`BpfObject::attach_with_options`].
#[derive(Debug, Clone)]
pub enum AttachTarget {
    /// `<system>/<symbol>` pair of a classic tracepoint.
    Tracepoint { system: String, symbol: String },
    /// `<symbol>[+<offset>]`; the section prefix decides kprobe vs kretprobe.
    Kprobe { symbol: String },
    RawTracepoint { symbol: String },
    /// Per-CPU `PERF_COUNT_SW_CPU_CLOCK` sampler. Period mode is not
    /// supported by this agent; a non-zero frequency is required.
    PerfEvent { sample_period: u64, sample_freq: u64 },
}

#[derive(Debug, Clone)]
pub struct AttachOption {
    pub program: String,
    pub target: AttachTarget,
}

/// Map metadata surfaced by [`BpfObject::info`].
#[derive(Debug, Clone, Serialize)]
pub struct MapInfo {
    pub id: u32,
    pub name: String,
    pub max_entries: u32,
}

/// Program metadata surfaced by [`BpfObject::info`].
#[derive(Debug, Clone, Serialize)]
pub struct ProgramInfo {
    pub id: u32,
    pub name: String,
    pub section: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub maps: Vec<MapInfo>,
    pub programs: Vec<ProgramInfo>,
}

/// One loaded eBPF object: maps, programs, and their attachments.
///
/// Dropping the handle closes every link, the sampler, and the kernel maps
/// and programs.
pub struct BpfObject {
    name: String,
    ebpf: Ebpf,
    maps: HashMap<u32, MapSpec>,
    programs: HashMap<u32, ProgramSpec>,
    map_ids: HashMap<String, u32>,
    prog_ids: HashMap<String, u32>,
    /// Kernel program ids for the liveness breaker, when resolvable.
    kernel_prog_ids: Vec<u32>,
    sampler: Option<PerfSampler>,
    /// Forwarder for in-object `bpf_printk`-style logging; absent when the
    /// object carries no log map.
    _logger: Option<EbpfLogger>,
}

impl BpfObject {
    /// Load an object file from disk, optionally rewriting declared
    /// constants before instantiation.
    pub fn load(path: &Path, consts: &[(&str, u64)]) -> Result<BpfObject> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let bytes = std::fs::read(path).map_err(|e| AgentError::file(path.display().to_string(), e))?;
        Self::load_from_bytes(&name, &bytes, consts)
    }

    /// Load an object from an in-memory image.
    pub fn load_from_bytes(name: &str, bytes: &[u8], consts: &[(&str, u64)]) -> Result<BpfObject> {
        let sections = program_sections(bytes)?;

        let mut loader = EbpfLoader::new();
        for (const_name, value) in consts {
            loader.set_global(*const_name, value, true);
        }
        let mut ebpf = loader.load(bytes).map_err(|e| AgentError::Bpf {
            name: name.to_string(),
            reason: format!("load: {e}"),
        })?;

        let logger = match EbpfLogger::init(&mut ebpf) {
            Ok(logger) => Some(logger),
            Err(e) => {
                debug!("bpf {name}: no object logger: {e}");
                None
            }
        };

        let mut obj = BpfObject {
            name: name.to_string(),
            ebpf,
            maps: HashMap::new(),
            programs: HashMap::new(),
            map_ids: HashMap::new(),
            prog_ids: HashMap::new(),
            kernel_prog_ids: Vec::new(),
            sampler: None,
            _logger: logger,
        };
        obj.index_maps();
        obj.index_programs(&sections);
        if obj.kernel_prog_ids.is_empty() {
            debug!("bpf {}: kernel program ids unresolved, breaker runs blind", obj.name);
        }

        info!("loaded bpf {}: {} maps, {} programs", obj.name, obj.maps.len(), obj.programs.len());
        Ok(obj)
    }

    fn index_maps(&mut self) {
        // Ids come from the kernel when the (truncated) name resolves;
        // otherwise a synthetic id from the top of the range, far away from
        // anything the kernel hands out.
        let kernel = kernel_map_ids();
        let mut synthetic = u32::MAX;
        let map_names: Vec<String> = self.ebpf.maps().map(|(n, _)| n.to_string()).collect();
        for map_name in map_names {
            let (id, max_entries) = kernel.get(truncated(&map_name)).copied().unwrap_or_else(|| {
                let id = synthetic;
                synthetic -= 1;
                (id, 0)
            });
            self.maps.insert(id, MapSpec { name: map_name.clone(), max_entries });
            self.map_ids.insert(map_name, id);
        }
    }

    fn index_programs(&mut self, sections: &HashMap<String, String>) {
        let kernel = kernel_program_ids();
        let mut synthetic = u32::MAX;
        let prog_names: Vec<String> = self.ebpf.programs().map(|(n, _)| n.to_string()).collect();
        for prog_name in prog_names {
            let id = match kernel.get(truncated(&prog_name)) {
                Some(&id) => {
                    self.kernel_prog_ids.push(id);
                    id
                }
                None => {
                    let id = synthetic;
                    synthetic -= 1;
                    id
                }
            };
            let section = sections.get(&prog_name).cloned().unwrap_or_default();
            self.programs.insert(
                id,
                ProgramSpec { name: prog_name.clone(), section, links: HashMap::new() },
            );
            self.prog_ids.insert(prog_name, id);
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn map_id_by_name(&self, name: &str) -> Option<u32> {
        self.map_ids.get(name).copied()
    }

    #[must_use]
    pub fn prog_id_by_name(&self, name: &str) -> Option<u32> {
        self.prog_ids.get(name).copied()
    }

    /// Map and program metadata for the control surface.
    #[must_use]
    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            maps: self
                .maps
                .iter()
                .map(|(id, m)| MapInfo { id: *id, name: m.name.clone(), max_entries: m.max_entries })
                .collect(),
            programs: self
                .programs
                .iter()
                .map(|(id, p)| ProgramInfo { id: *id, name: p.name.clone(), section: p.section.clone() })
                .collect(),
        }
    }

    /// Attach every program according to its section name. Rolls everything
    /// back on the first failure.
    pub fn attach(&mut self) -> Result<()> {
        let result = self.attach_all_by_section();
        if result.is_err() {
            let _ = self.detach();
        }
        result
    }

    fn attach_all_by_section(&mut self) -> Result<()> {
        let ids: Vec<u32> = self.programs.keys().copied().collect();
        for id in ids {
            let (prog_name, section) = {
                let spec = &self.programs[&id];
                (spec.name.clone(), spec.section.clone())
            };
            let target = parse_section(&self.name, &section)?;
            if matches!(target, AttachTarget::PerfEvent { .. }) {
                return Err(AgentError::Bpf {
                    name: self.name.clone(),
                    reason: format!("program {prog_name}: perf_event needs an explicit sample frequency"),
                });
            }
            self.attach_one(id, &prog_name, &target)?;
        }
        Ok(())
    }

    /// Attach selected programs with explicit targets. Rolls everything back
    /// on the first failure.
    pub fn attach_with_options(&mut self, opts: &[AttachOption]) -> Result<()> {
        let result = (|| {
            for opt in opts {
                let id = self.prog_id_by_name(&opt.program).ok_or_else(|| AgentError::NotFound {
                    kind: "program",
                    name: opt.program.clone(),
                })?;
                let prog_name = opt.program.clone();
                self.attach_one(id, &prog_name, &opt.target)?;
            }
            Ok(())
        })();
        if result.is_err() {
            let _ = self.detach();
        }
        result
    }

    fn attach_one(&mut self, prog_id: u32, prog_name: &str, target: &AttachTarget) -> Result<()> {
        match target {
            AttachTarget::Tracepoint { system, symbol } => {
                let link_key = format!("{system}/{symbol}");
                self.check_link_key(prog_id, prog_name, &link_key)?;
                let program: &mut TracePoint = self.program_mut(prog_name)?.try_into()?;
                program.load()?;
                let link_id = program.attach(system, symbol)?;
                let link = program.take_link(link_id)?;
                info!("bpf {}: attach tracepoint {system}/{symbol} ({prog_name})", self.name);
                self.store_link(prog_id, link_key, OwnedLink::TracePoint(link));
            }
            AttachTarget::Kprobe { symbol } => {
                let (fn_name, offset) = parse_kprobe_symbol(&self.name, symbol)?;
                let is_ret = self.programs[&prog_id].section.starts_with("kretprobe/");
                let link_key =
                    if is_ret { fn_name.to_string() } else { format!("{fn_name}+{offset}") };
                self.check_link_key(prog_id, prog_name, &link_key)?;
                let program: &mut KProbe = self.program_mut(prog_name)?.try_into()?;
                program.load()?;
                let link_id = program.attach(fn_name, offset)?;
                let link = program.take_link(link_id)?;
                info!("bpf {}: attach {} {symbol} ({prog_name})",
                    self.name, if is_ret { "kretprobe" } else { "kprobe" });
                self.store_link(prog_id, link_key, OwnedLink::KProbe(link));
            }
            AttachTarget::RawTracepoint { symbol } => {
                let link_key = symbol.clone();
                self.check_link_key(prog_id, prog_name, &link_key)?;
                let program: &mut RawTracePoint = self.program_mut(prog_name)?.try_into()?;
                program.load()?;
                let link_id = program.attach(symbol)?;
                let link = program.take_link(link_id)?;
                info!("bpf {}: attach raw tracepoint {symbol} ({prog_name})", self.name);
                self.store_link(prog_id, link_key, OwnedLink::RawTracePoint(link));
            }
            AttachTarget::PerfEvent { sample_period, sample_freq } => {
                self.attach_sampler(prog_name, *sample_period, *sample_freq)?;
            }
        }
        Ok(())
    }

    /// Attach one `PERF_COUNT_SW_CPU_CLOCK` sampler per online CPU.
    ///
    /// A period variant is not supported; a non-zero frequency is required.
    /// At most one sampler per object.
    fn attach_sampler(&mut self, prog_name: &str, sample_period: u64, sample_freq: u64) -> Result<()> {
        if self.sampler.is_some() {
            return Err(AgentError::DuplicateAttach {
                program: prog_name.to_string(),
                key: "perf_event".to_string(),
            });
        }
        if sample_period != 0 {
            return Err(AgentError::NotSupported);
        }
        if sample_freq == 0 {
            return Err(AgentError::InvalidArgs("perf sample frequency must be non-zero".into()));
        }

        let program: &mut PerfEvent = self.program_mut(prog_name)?.try_into()?;
        program.load()?;

        let cpus = online_cpus().map_err(|(_, e)| AgentError::Io(e))?;
        let sampler = PerfSampler::attach(program, &cpus, sample_freq)?;
        debug!("bpf {}: perf sampler on {} CPUs at {} Hz", self.name, cpus.len(), sample_freq);
        self.sampler = Some(sampler);
        Ok(())
    }

    fn check_link_key(&self, prog_id: u32, prog_name: &str, key: &str) -> Result<()> {
        if self.programs[&prog_id].links.contains_key(key) {
            return Err(AgentError::DuplicateAttach {
                program: prog_name.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn store_link(&mut self, prog_id: u32, key: String, link: OwnedLink) {
        if let Some(spec) = self.programs.get_mut(&prog_id) {
            spec.links.insert(key, link);
        }
    }

    fn program_mut(&mut self, name: &str) -> Result<&mut Program> {
        self.ebpf
            .program_mut(name)
            .ok_or_else(|| AgentError::NotFound { kind: "program", name: name.to_string() })
    }

    /// Detach every link and the perf sampler. Idempotent; per-section
    /// results are logged, nothing is surfaced to the caller.
    pub fn detach(&mut self) -> Result<()> {
        for spec in self.programs.values_mut() {
            for (key, _link) in spec.links.drain() {
                info!("bpf {}: detach {} ({})", self.name, spec.section, key);
            }
        }
        if let Some(sampler) = self.sampler.take() {
            drop(sampler);
            info!("bpf {}: detach perf sampler", self.name);
        }
        Ok(())
    }

    /// Whether the kernel still holds every program of this object.
    ///
    /// Returns `true` when ids could not be resolved at load time; the
    /// breaker cannot distinguish loss from blindness in that case.
    #[must_use]
    pub fn loaded(&self) -> bool {
        if self.kernel_prog_ids.is_empty() {
            return true;
        }
        let alive: Vec<u32> = aya::programs::loaded_programs()
            .filter_map(|p| p.ok().map(|info| info.id()))
            .collect();
        self.kernel_prog_ids.iter().all(|id| alive.contains(id))
    }

    /// Background check that cancels `token` if the kernel drops our
    /// programs out from under us, so a probe does not die silently.
    pub fn wait_detach_by_breaker(&self, token: &CancellationToken) {
        let ids = self.kernel_prog_ids.clone();
        let name = self.name.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if ids.is_empty() {
                return;
            }
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(BREAKER_INTERVAL) => {}
                }
                let alive: Vec<u32> = aya::programs::loaded_programs()
                    .filter_map(|p| p.ok().map(|info| info.id()))
                    .collect();
                if !ids.iter().all(|id| alive.contains(id)) {
                    warn!("bpf {name}: programs vanished from the kernel, breaking");
                    token.cancel();
                    return;
                }
            }
        });
    }

    /// Read one value from a hash map.
    pub fn read_map<K: Pod, V: Pod>(&self, map_id: u32, key: &K) -> Result<V> {
        let map = self.map_ref(map_id)?;
        let hash: aya::maps::HashMap<&MapData, K, V> = aya::maps::HashMap::try_from(map)?;
        Ok(hash.get(key, 0)?)
    }

    /// Write items one by one; stops at the first failure with the partial
    /// state preserved. Callers treat this as best-effort.
    pub fn write_map<K: Pod, V: Pod>(&mut self, map_id: u32, items: &[(K, V)]) -> Result<()> {
        let name = self.map_name(map_id)?.to_string();
        let map = self
            .ebpf
            .map_mut(&name)
            .ok_or_else(|| AgentError::NotFound { kind: "map", name: name.clone() })?;
        let mut hash: aya::maps::HashMap<&mut MapData, K, V> = aya::maps::HashMap::try_from(map)?;
        for (key, value) in items {
            hash.insert(key, value, 0)?;
        }
        Ok(())
    }

    /// Delete keys one by one; same semantics as [`BpfObject::write_map`].
    pub fn delete_map_items<K: Pod>(&mut self, map_id: u32, keys: &[K]) -> Result<()> {
        let name = self.map_name(map_id)?.to_string();
        let map = self
            .ebpf
            .map_mut(&name)
            .ok_or_else(|| AgentError::NotFound { kind: "map", name: name.clone() })?;
        let mut hash: aya::maps::HashMap<&mut MapData, K, u8> = aya::maps::HashMap::try_from(map)?;
        for key in keys {
            hash.remove(key)?;
        }
        Ok(())
    }

    /// Dump a hash map via next-key traversal, bounded by the map's
    /// `max_entries`. Entries whose lookup races a concurrent deletion are
    /// skipped.
    pub fn dump_map<K: Pod, V: Pod>(&self, map_id: u32) -> Result<Vec<(K, V)>> {
        let max_entries = self.maps.get(&map_id).map_or(0, |m| m.max_entries);
        let bound = if max_entries == 0 { usize::MAX } else { max_entries as usize };

        let map = self.map_ref(map_id)?;
        let hash: aya::maps::HashMap<&MapData, K, V> = aya::maps::HashMap::try_from(map)?;
        let mut items = Vec::new();
        for entry in hash.iter().take(bound) {
            match entry {
                Ok(pair) => items.push(pair),
                // key vanished between next_key and lookup
                Err(aya::maps::MapError::KeyNotFound) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(items)
    }

    pub fn dump_map_by_name<K: Pod, V: Pod>(&self, name: &str) -> Result<Vec<(K, V)>> {
        let id = self
            .map_id_by_name(name)
            .ok_or_else(|| AgentError::NotFound { kind: "map", name: name.to_string() })?;
        self.dump_map(id)
    }

    /// Open a per-CPU perf ring consumer on the named perf-event-array map.
    ///
    /// Takes the map out of the handle; one pipe per map.
    pub fn event_pipe(
        &mut self,
        map_name: &str,
        per_cpu_buffer: usize,
        parent: &CancellationToken,
    ) -> Result<PerfReader> {
        let map = self.ebpf.take_map(map_name).ok_or_else(|| AgentError::NotFound {
            kind: "map",
            name: map_name.to_string(),
        })?;
        let reader = PerfReader::new(map, per_cpu_buffer, parent)?;
        debug!("bpf {}: event pipe on {map_name}, per-CPU buffer {per_cpu_buffer}", self.name);
        Ok(reader)
    }

    /// [`BpfObject::event_pipe`] addressed by map id.
    pub fn event_pipe_by_id(
        &mut self,
        map_id: u32,
        per_cpu_buffer: usize,
        parent: &CancellationToken,
    ) -> Result<PerfReader> {
        let name = self.map_name(map_id)?.to_string();
        self.event_pipe(&name, per_cpu_buffer, parent)
    }

    /// Open the pipe first, then attach; close the pipe if attach fails.
    pub fn attach_and_event_pipe(
        &mut self,
        map_name: &str,
        per_cpu_buffer: usize,
        parent: &CancellationToken,
    ) -> Result<PerfReader> {
        let mut reader = self.event_pipe(map_name, per_cpu_buffer, parent)?;
        if let Err(e) = self.attach() {
            reader.close();
            return Err(e);
        }
        Ok(reader)
    }

    fn map_name(&self, map_id: u32) -> Result<&str> {
        self.maps
            .get(&map_id)
            .map(|m| m.name.as_str())
            .ok_or(AgentError::NotFound { kind: "map", name: format!("id {map_id}") })
    }

    fn map_ref(&self, map_id: u32) -> Result<&aya::maps::Map> {
        let name = self.map_name(map_id)?;
        self.ebpf
            .map(name)
            .ok_or_else(|| AgentError::NotFound { kind: "map", name: name.to_string() })
    }
}

impl Drop for BpfObject {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

impl std::fmt::Display for BpfObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}#{}", self.name, self.maps.len(), self.programs.len())
    }
}

/// Extract `function name -> section name` from the ELF image. aya keys
/// programs by function name but drops the section string we need for the
/// attach contract.
fn program_sections(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let file = object::File::parse(bytes)
        .map_err(|e| AgentError::InvalidArgs(format!("parse bpf elf: {e}")))?;

    let mut sections = HashMap::new();
    for sym in file.symbols() {
        if sym.kind() != object::SymbolKind::Text || sym.size() == 0 {
            continue;
        }
        let Some(index) = sym.section_index() else { continue };
        let Ok(section) = file.section_by_index(index) else { continue };
        let Ok(section_name) = section.name() else { continue };
        if let Ok(name) = sym.name() {
            sections.insert(name.to_string(), section_name.to_string());
        }
    }
    Ok(sections)
}

/// Parse the attach target out of a section name.
fn parse_section(obj: &str, section: &str) -> Result<AttachTarget> {
    let mut parts = section.splitn(2, '/');
    let prefix = parts.next().unwrap_or_default();
    let rest = parts.next();

    match (prefix, rest) {
        ("tracepoint", Some(rest)) => {
            let (system, symbol) = rest.split_once('/').ok_or_else(|| AgentError::Bpf {
                name: obj.to_string(),
                reason: format!("invalid section name: {section}"),
            })?;
            Ok(AttachTarget::Tracepoint { system: system.to_string(), symbol: symbol.to_string() })
        }
        ("kprobe" | "kretprobe", Some(symbol)) => {
            Ok(AttachTarget::Kprobe { symbol: symbol.to_string() })
        }
        ("raw_tracepoint" | "raw_tp", Some(symbol)) => {
            Ok(AttachTarget::RawTracepoint { symbol: symbol.to_string() })
        }
        ("perf_event", _) => Ok(AttachTarget::PerfEvent { sample_period: 0, sample_freq: 0 }),
        _ => Err(AgentError::Bpf {
            name: obj.to_string(),
            reason: format!("unsupported section: {section}"),
        }),
    }
}

/// Split `<symbol>[+<offset>]` with a decimal offset.
fn parse_kprobe_symbol<'a>(obj: &str, symbol: &'a str) -> Result<(&'a str, u64)> {
    match symbol.split_once('+') {
        None => Ok((symbol, 0)),
        Some((name, offset)) => {
            let offset = offset.parse::<u64>().map_err(|_| AgentError::Bpf {
                name: obj.to_string(),
                reason: format!("invalid symbol: {symbol}"),
            })?;
            if name.is_empty() {
                return Err(AgentError::Bpf {
                    name: obj.to_string(),
                    reason: format!("invalid symbol: {symbol}"),
                });
            }
            Ok((name, offset))
        }
    }
}

/// Kernel names are truncated to 15 bytes plus NUL.
fn truncated(name: &str) -> &str {
    &name[..name.len().min(15)]
}

fn kernel_map_ids() -> HashMap<String, (u32, u32)> {
    let mut ids = HashMap::new();
    for info in aya::maps::loaded_maps().filter_map(|m| m.ok()) {
        if let Some(name) = info.name_as_str() {
            // Newer ids win; our maps were created last.
            let entry = ids.entry(name.to_string()).or_insert((0, 0));
            if info.id() > entry.0 {
                *entry = (info.id(), info.max_entries());
            }
        }
    }
    ids
}

fn kernel_program_ids() -> HashMap<String, u32> {
    let mut ids = HashMap::new();
    for info in aya::programs::loaded_programs().filter_map(|p| p.ok()) {
        if let Some(name) = info.name_as_str() {
            let entry = ids.entry(name.to_string()).or_insert(0);
            if info.id() > *entry {
                *entry = info.id();
            }
        }
    }
    ids
}
