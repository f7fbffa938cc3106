//! Kernel symbol table from /proc/kallsyms
//!
//! Only text symbols (`T`/`t`) are retained, sorted by address. Lookup
//! returns the symbol at the greatest address at or below the target; below
//! the lowest known address a `[unknown]` sentinel comes back instead.

use log::debug;
use std::io::{BufRead, BufReader, Read};
use std::sync::OnceLock;

use crate::domain::{AgentError, Result};

const KALLSYMS_PATH: &str = "/proc/kallsyms";
const MODULE_KERNEL: &str = "[kernel]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSymbol {
    pub addr: u64,
    pub name: String,
    pub module: String,
}

impl KernelSymbol {
    fn sentinel() -> KernelSymbol {
        KernelSymbol { addr: 0, name: String::new(), module: "[unknown]".to_string() }
    }
}

impl std::fmt::Display for KernelSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:x} {}", self.name, self.addr, self.module)
    }
}

pub struct KernelSymbols {
    /// Sorted by address; index 0 is the sentinel.
    symbols: Vec<KernelSymbol>,
}

impl KernelSymbols {
    /// Parse kallsyms-formatted lines: `<addr> <type> <name> [module]`.
    pub fn parse<R: Read>(reader: R) -> Result<KernelSymbols> {
        let mut symbols = vec![KernelSymbol::sentinel()];

        for line in BufReader::new(reader).lines() {
            let line = line?;
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.len() != 3 && words.len() != 4 {
                continue;
            }
            // text symbols only
            if words[1] != "T" && words[1] != "t" {
                continue;
            }
            let Ok(addr) = u64::from_str_radix(words[0], 16) else {
                continue;
            };
            let module =
                if words.len() == 4 { words[3].to_string() } else { MODULE_KERNEL.to_string() };
            symbols.push(KernelSymbol { addr, name: words[2].to_string(), module });
        }

        symbols.sort_by_key(|s| s.addr);
        Ok(KernelSymbols { symbols })
    }

    pub fn load() -> Result<KernelSymbols> {
        let file = std::fs::File::open(KALLSYMS_PATH)
            .map_err(|e| AgentError::file(KALLSYMS_PATH, e))?;
        Self::parse(file)
    }

    /// The symbol covering `addr`: exact match, else the closest one below,
    /// else the sentinel.
    #[must_use]
    pub fn search(&self, addr: u64) -> &KernelSymbol {
        match self.symbols.binary_search_by_key(&addr, |s| s.addr) {
            Ok(i) => &self.symbols[i],
            Err(0) => &self.symbols[0],
            Err(i) => &self.symbols[i - 1],
        }
    }

    /// Render a raw kernel stack as `"<name>/<hex addr> <module>"` lines.
    ///
    /// Stops at the first zero address or at `max_depth` frames; addresses
    /// resolving to the sentinel's empty name are skipped.
    #[must_use]
    pub fn render_stack(&self, stack: &[u64], max_depth: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for &addr in stack.iter().take(max_depth) {
            if addr == 0 {
                break;
            }
            let sym = self.search(addr);
            if !sym.name.is_empty() {
                lines.push(sym.to_string());
            }
        }
        lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // the sentinel is always there
        self.symbols.len() <= 1
    }
}

/// Process-wide kallsyms cache, loaded on first use.
pub fn kernel_symbols() -> &'static KernelSymbols {
    static CACHE: OnceLock<KernelSymbols> = OnceLock::new();
    CACHE.get_or_init(|| {
        KernelSymbols::load().unwrap_or_else(|e| {
            debug!("kallsyms unavailable: {e}");
            KernelSymbols { symbols: vec![KernelSymbol::sentinel()] }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
0000000000001000 T start_kernel
0000000000002000 t do_idle
0000000000003000 T vfs_read
0000000000004000 D some_data
0000000000005000 t nf_hook_slow [nf_tables]
";

    fn table() -> KernelSymbols {
        KernelSymbols::parse(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_keeps_text_symbols_only() {
        let t = table();
        // sentinel + 4 text symbols; the D symbol is dropped
        assert_eq!(t.len(), 5);
    }

    #[test]
    fn test_search_exact_match() {
        let t = table();
        assert_eq!(t.search(0x3000).name, "vfs_read");
    }

    #[test]
    fn test_search_between_symbols_returns_preceding() {
        let t = table();
        assert_eq!(t.search(0x3abc).name, "vfs_read");
        assert_eq!(t.search(0x2fff).name, "do_idle");
    }

    #[test]
    fn test_search_below_lowest_returns_sentinel() {
        let t = table();
        let sym = t.search(0x1);
        assert_eq!(sym.addr, 0);
        assert_eq!(sym.name, "");
        assert_eq!(sym.module, "[unknown]");
    }

    #[test]
    fn test_module_symbol_retains_module_name() {
        let t = table();
        assert_eq!(t.search(0x5000).module, "[nf_tables]");
        assert_eq!(t.search(0x3000).module, "[kernel]");
    }

    #[test]
    fn test_render_stack_stops_at_zero() {
        let t = table();
        let lines = t.render_stack(&[0x3000, 0x2000, 0, 0x1000], 16);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "vfs_read/3000 [kernel]");
        assert_eq!(lines[1], "do_idle/2000 [kernel]");
    }

    #[test]
    fn test_render_stack_honors_max_depth() {
        let t = table();
        let lines = t.render_stack(&[0x1000, 0x2000, 0x3000], 2);
        assert_eq!(lines.len(), 2);
    }
}
