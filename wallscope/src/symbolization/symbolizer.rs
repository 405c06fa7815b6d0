use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use log::warn;
use object::{Object, ObjectSection, ObjectSymbol};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use super::memory_maps::{main_executable_range, MemoryRange};

/// Resolves sampled program counters to function names and source locations
///
/// DWARF is consulted first (function, file, line, through inlining); the
/// ELF symbol table is the fallback for binaries built without debug info.
/// Resolved addresses are cached, since a wall-clock profile concentrates
/// thousands of samples on a handful of hot addresses.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// `(address, size, demangled name)` of function symbols, sorted by address
    symtab: Vec<(u64, u64, String)>,
    /// Load range of the binary, for PIE adjustment of runtime addresses
    exe_range: Option<MemoryRange>,
    /// Cache of resolved symbols by file-relative address
    cache: RefCell<HashMap<u64, ResolvedSymbol>>,
}

impl Symbolizer {
    /// Create a symbolizer for the current executable.
    ///
    /// Runtime addresses handed to [`Symbolizer::resolve_runtime`] are
    /// adjusted by the executable's load base, so sampled pcs can be passed
    /// in directly.
    ///
    /// # Errors
    /// Returns an error if the executable cannot be read or parsed.
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to resolve /proc/self/exe")?;
        let mut sym = Self::new(&exe)?;
        match main_executable_range() {
            Ok(range) => sym.exe_range = Some(range),
            // Without the range only non-PIE binaries resolve; keep going
            Err(err) => warn!("No load range for {}: {err:#}", exe.display()),
        }
        Ok(sym)
    }

    /// Create a new symbolizer for the given binary.
    ///
    /// # Errors
    /// Returns an error if the binary file cannot be read or parsed.
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref()).context("Failed to read binary file")?;

        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        let mut symtab: Vec<(u64, u64, String)> = obj_file
            .symbols()
            .filter(|sym| sym.kind() == object::SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                Some((sym.address(), sym.size(), Self::demangle_symbol(name)))
            })
            .collect();
        symtab.sort_by_key(|&(addr, _, _)| addr);

        Ok(Self { ctx, symtab, exe_range: None, cache: RefCell::new(HashMap::new()) })
    }

    /// Resolve a runtime address (a sampled pc), adjusting for PIE load base
    /// when the address falls inside the binary's range.
    pub fn resolve_runtime(&self, addr: u64) -> ResolvedSymbol {
        let file_addr = match self.exe_range {
            Some(range) if range.contains(addr) => addr - range.start,
            _ => addr,
        };
        self.resolve(file_addr)
    }

    /// Resolve a file-relative address to a function name and location.
    pub fn resolve(&self, addr: u64) -> ResolvedSymbol {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let resolved = self
            .resolve_dwarf(addr)
            .or_else(|| self.resolve_symtab(addr))
            .unwrap_or_else(|| ResolvedSymbol {
                addr,
                function: "<unknown>".to_string(),
                file: None,
                line: None,
            });

        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }

    /// The innermost inlined frame at `addr`, per DWARF.
    fn resolve_dwarf(&self, addr: u64) -> Option<ResolvedSymbol> {
        let mut frames = self.ctx.find_frames(addr).skip_all_loads().ok()?;
        let frame = frames.next().ok()??;

        let function = frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()))?;
        let (file, line) = frame.location.map_or((None, None), |loc| {
            (loc.file.map(std::string::ToString::to_string), loc.line)
        });

        Some(ResolvedSymbol { addr, function, file, line })
    }

    /// Nearest function symbol at or below `addr`, per the ELF symbol table.
    fn resolve_symtab(&self, addr: u64) -> Option<ResolvedSymbol> {
        let idx = self.symtab.partition_point(|&(start, _, _)| start <= addr).checked_sub(1)?;
        let (start, size, ref name) = self.symtab[idx];
        // Zero-sized symbols (assembly labels) match by proximity only
        if size > 0 && addr >= start + size {
            return None;
        }
        Some(ResolvedSymbol { addr, function: name.clone(), file: None, line: None })
    }

    /// Demangle a Rust symbol name, dropping the trailing hash.
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

/// A resolved program counter
#[derive(Debug, Clone)]
pub struct ResolvedSymbol {
    pub addr: u64,
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedSymbol {
    /// "function (file:line)" when the location is known, else the function.
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => {
                // Long cargo registry paths drown the report; keep the tail
                let short = file.rsplit('/').next().unwrap_or(file);
                format!("{} ({short}:{line})", self.function)
            }
            _ => self.function.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_rust_symbol() {
        let demangled =
            Symbolizer::demangle_symbol("_ZN4core3ptr13drop_in_place17h1c2e8a3f5d4b6e7fE");
        assert_eq!(demangled, "core::ptr::drop_in_place");
    }

    #[test]
    fn test_demangle_passthrough_for_plain_names() {
        assert_eq!(Symbolizer::demangle_symbol("main"), "main");
    }

    #[test]
    fn test_describe_with_location() {
        let sym = ResolvedSymbol {
            addr: 0x1000,
            function: "demo::spin".to_string(),
            file: Some("/long/path/to/demo.rs".to_string()),
            line: Some(42),
        };
        assert_eq!(sym.describe(), "demo::spin (demo.rs:42)");
    }

    #[test]
    fn test_describe_without_location() {
        let sym = ResolvedSymbol {
            addr: 0x1000,
            function: "demo::spin".to_string(),
            file: None,
            line: None,
        };
        assert_eq!(sym.describe(), "demo::spin");
    }
}
