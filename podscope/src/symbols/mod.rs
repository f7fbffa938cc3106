//! Symbol resolution for kernel and user stacks
//!
//! - [`ksyms`]: /proc/kallsyms text symbols, loaded once, binary-searched
//!   by instruction pointer for stack pretty-printing.
//! - [`usyms`]: per-PID ELF section/symbol caches plus a shared library
//!   cache for user-space addresses.

pub mod ksyms;
pub mod usyms;

pub use ksyms::{kernel_symbols, KernelSymbol, KernelSymbols};
pub use usyms::UserSymbols;

/// Deepest kernel stack the probes will render.
pub const STACK_MAX_DEPTH: usize = podscope_common::STACK_MAX_DEPTH;
