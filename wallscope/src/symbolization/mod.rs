//! # Symbol Resolution for Sampled Program Counters
//!
//! The engine records raw instruction pointers like `0x55f3a2b4c780`; this
//! module turns them into function names and source locations when building
//! reports and exports.
//!
//! Two sources are consulted, in order:
//! - **DWARF debug info** (via `gimli`/`addr2line`): function, file and
//!   line, including through inlining. Present when the profiled binary was
//!   built with `debug = true`.
//! - **ELF symbol table** (via `object`): function name only. Survives in
//!   release binaries that were not stripped, which is why preflight checks
//!   for `.symtab` rather than DWARF.
//!
//! ## PIE adjustment
//!
//! Modern executables are position independent: DWARF and symtab speak in
//! file-relative addresses while samples carry runtime addresses randomized
//! by ASLR. [`memory_maps::main_executable_range`] reads `/proc/self/maps`
//! so callers can subtract the load base before resolving:
//!
//! ```text
//! file offset = runtime address - base address
//! ```
//!
//! Addresses outside the main executable (libc, vdso) resolve to
//! `<unknown>`; a single-binary profiler has no business parsing every
//! shared object on the box.
//!
//! ## Classification support
//!
//! [`memory_maps::CodeMap`] is the other consumer of `/proc/self/maps`: the
//! set of executable regions, used by thread-state classification to decide
//! whether an address one instruction before a sampled pc may be probed.
//! Unlike symbolization this covers *all* mappings, not just the main
//! executable.
//!
//! All resolution happens on the reporting path, never in signal context.

pub mod memory_maps;
pub mod symbolizer;

pub use memory_maps::{main_executable_range, CodeMap, MemoryRange};
pub use symbolizer::Symbolizer;
