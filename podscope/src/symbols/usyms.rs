//! User-space symbol resolution
//!
//! Two-level cache: per-PID ELF sections plus the executable's symbol
//! table, and a process-wide cache of shared-library symbol tables keyed by
//! path. Resolution first finds the section containing the address, then
//! binary-searches the owning table. An address outside every section
//! resolves to the empty string; a covered address with no symbol resolves
//! to `"<unknown>"`.

use log::debug;
use object::{Object as _, ObjectSymbol};
use rustc_demangle::demangle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::{AgentError, Result};

/// Pseudo-paths in /proc/<pid>/maps that are not backed by a loadable ELF.
const UNBACKED: &[&str] = &[
    "anon_inode:[perf_event]",
    "[stack]",
    "[vvar]",
    "[vdso]",
    "[vsyscall]",
    "[heap]",
    "//anon",
    "/dev/zero",
    "/anon_hugepage",
    "/SYSV",
];

#[derive(Debug, Clone)]
struct ElfSymbol {
    name: String,
    start: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    /// A section of the main executable; addresses are looked up as-is.
    Exe,
    /// A mapped library region; addresses are rebased to the mapping start.
    Lib,
}

#[derive(Debug, Clone)]
struct Section {
    name: String,
    start: u64,
    end: u64,
    kind: SectionKind,
}

struct ProcCache {
    sections: Vec<Section>,
    exe_symbols: Vec<ElfSymbol>,
}

/// Resolver with per-PID and per-library caches.
pub struct UserSymbols {
    procs: HashMap<u32, ProcCache>,
    libs: HashMap<String, Vec<ElfSymbol>>,
}

impl Default for UserSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl UserSymbols {
    #[must_use]
    pub fn new() -> UserSymbols {
        UserSymbols { procs: HashMap::new(), libs: HashMap::new() }
    }

    /// Resolve a user-space address for `pid` to a demangled symbol name.
    ///
    /// Returns an empty string when the address is in no known section and
    /// `"<unknown>"` when a section matches but no symbol covers it.
    pub fn resolve(&mut self, pid: u32, addr: u64) -> Result<String> {
        if !self.procs.contains_key(&pid) {
            let cache = load_proc_cache(pid)?;
            self.procs.insert(pid, cache);
        }
        let cache = &self.procs[&pid];

        let Some(section) = find_section(&cache.sections, addr) else {
            return Ok(String::new());
        };

        match section.kind {
            SectionKind::Exe => Ok(search_symbols(&cache.exe_symbols, addr)),
            SectionKind::Lib => {
                let lib_path = section.name.clone();
                let offset = addr - section.start;
                if !self.libs.contains_key(&lib_path) {
                    let symbols = match load_elf_symbols(Path::new(&lib_path)) {
                        Ok(symbols) => symbols,
                        Err(e) => {
                            debug!("load library {lib_path}: {e}");
                            Vec::new()
                        }
                    };
                    self.libs.insert(lib_path.clone(), symbols);
                }
                Ok(search_symbols(&self.libs[&lib_path], offset))
            }
        }
    }

    /// Drop the cache for an exited process.
    pub fn forget(&mut self, pid: u32) {
        self.procs.remove(&pid);
    }
}

fn exe_path(pid: u32) -> Result<PathBuf> {
    let link = format!("/proc/{pid}/exe");
    let target = std::fs::read_link(&link).map_err(|e| AgentError::file(&link, e))?;
    // resolve inside the process' own root so containers work
    Ok(PathBuf::from(format!("/proc/{pid}/root")).join(target.strip_prefix("/").unwrap_or(&target)))
}

fn load_proc_cache(pid: u32) -> Result<ProcCache> {
    let path = exe_path(pid)?;
    let data = std::fs::read(&path).map_err(|e| AgentError::file(path.display().to_string(), e))?;
    let file = object::File::parse(&*data)
        .map_err(|e| AgentError::InvalidArgs(format!("parse {}: {e}", path.display())))?;

    let mut sections = Vec::new();
    for section in file.sections() {
        use object::ObjectSection;
        let name = section.name().unwrap_or_default().to_string();
        sections.push(Section {
            name,
            start: section.address(),
            end: section.address() + section.size(),
            kind: SectionKind::Exe,
        });
    }

    let exe_symbols = collect_symbols(&file);

    // library-backed regions from the memory map
    let maps_path = format!("/proc/{pid}/maps");
    let maps = std::fs::read_to_string(&maps_path).map_err(|e| AgentError::file(&maps_path, e))?;
    for line in maps.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let path = fields[5];
        if UNBACKED.iter().any(|p| path.starts_with(p)) {
            continue;
        }
        let Some((start, end)) = fields[0].split_once('-') else { continue };
        let (Ok(start), Ok(end)) =
            (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        sections.push(Section { name: path.to_string(), start, end, kind: SectionKind::Lib });
    }

    sections.sort_by_key(|s| s.start);
    Ok(ProcCache { sections, exe_symbols })
}

fn load_elf_symbols(path: &Path) -> Result<Vec<ElfSymbol>> {
    let data = std::fs::read(path).map_err(|e| AgentError::file(path.display().to_string(), e))?;
    let file = object::File::parse(&*data)
        .map_err(|e| AgentError::InvalidArgs(format!("parse {}: {e}", path.display())))?;
    Ok(collect_symbols(&file))
}

fn collect_symbols(file: &object::File<'_>) -> Vec<ElfSymbol> {
    let mut symbols = Vec::new();
    for sym in file.dynamic_symbols().chain(file.symbols()) {
        if sym.kind() != object::SymbolKind::Text {
            continue;
        }
        if let Ok(name) = sym.name() {
            symbols.push(ElfSymbol {
                name: format!("{:#}", demangle(name)),
                start: sym.address(),
                size: sym.size(),
            });
        }
    }
    symbols.sort_by_key(|s| s.start);
    symbols
}

fn find_section<'a>(sections: &'a [Section], addr: u64) -> Option<&'a Section> {
    let idx = sections.partition_point(|s| s.start <= addr);
    if idx == 0 {
        return None;
    }
    let section = &sections[idx - 1];
    (addr < section.end).then_some(section)
}

fn search_symbols(symbols: &[ElfSymbol], addr: u64) -> String {
    let idx = symbols.partition_point(|s| s.start <= addr);
    if idx == 0 {
        return "<unknown>".to_string();
    }
    let sym = &symbols[idx - 1];
    if sym.size == 0 || addr < sym.start + sym.size {
        sym.name.clone()
    } else {
        "<unknown>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, start: u64, end: u64, kind: SectionKind) -> Section {
        Section { name: name.to_string(), start, end, kind }
    }

    #[test]
    fn test_find_section() {
        let sections = vec![
            section(".text", 0x1000, 0x2000, SectionKind::Exe),
            section("/lib/libc.so.6", 0x7f00, 0x8f00, SectionKind::Lib),
        ];
        assert_eq!(find_section(&sections, 0x1800).unwrap().name, ".text");
        assert_eq!(find_section(&sections, 0x8000).unwrap().name, "/lib/libc.so.6");
        assert!(find_section(&sections, 0x500).is_none());
        assert!(find_section(&sections, 0x3000).is_none());
    }

    #[test]
    fn test_search_symbols_coverage() {
        let symbols = vec![
            ElfSymbol { name: "alpha".into(), start: 0x100, size: 0x40 },
            ElfSymbol { name: "beta".into(), start: 0x200, size: 0x10 },
        ];
        assert_eq!(search_symbols(&symbols, 0x110), "alpha");
        assert_eq!(search_symbols(&symbols, 0x208), "beta");
        // past beta's extent
        assert_eq!(search_symbols(&symbols, 0x300), "<unknown>");
        // below the first symbol
        assert_eq!(search_symbols(&symbols, 0x50), "<unknown>");
    }

    #[test]
    fn test_zero_sized_symbol_covers_forward() {
        let symbols = vec![ElfSymbol { name: "label".into(), start: 0x100, size: 0 }];
        assert_eq!(search_symbols(&symbols, 0x150), "label");
    }

    #[test]
    fn test_resolve_self_exe_sections_load() {
        let pid = std::process::id();
        let mut usyms = UserSymbols::new();
        // resolving any address must not error once /proc/self is readable;
        // the answer depends on the test binary's layout
        let _ = usyms.resolve(pid, 0x1000);
    }
}
