//! `/proc/self/maps` parsing
//!
//! Provides the main executable's load range (for PIE address adjustment
//! when symbolizing) and the set of all executable regions (for the
//! classifier's is-this-address-code check).

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;

/// A half-open address range `[start, end)` in this process's address space
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// All executable (`r-xp`/`rwxp`) regions of the current process.
///
/// A snapshot; Rust processes without a JIT do not grow new executable
/// mappings after startup, so one snapshot at sampler start is enough.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    /// Sorted by start address, non-overlapping
    regions: Vec<MemoryRange>,
}

impl CodeMap {
    /// Snapshot the executable regions of the current process.
    ///
    /// # Errors
    /// Returns an error if `/proc/self/maps` cannot be read.
    pub fn load() -> Result<Self> {
        let maps =
            fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;

        let mut regions: Vec<MemoryRange> = maps
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let range = parts.next()?;
                let perms = parts.next()?;
                if !perms.contains('x') {
                    return None;
                }
                let (start, end) = parse_range(range)?;
                Some(MemoryRange { start, end })
            })
            .collect();
        regions.sort_by_key(|r| r.start);

        debug!("Code map: {} executable regions", regions.len());
        Ok(Self { regions })
    }

    /// Whether `addr` lies inside any executable region.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        // Regions are sorted; find the first region ending above addr
        let idx = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(idx).is_some_and(|r| r.contains(addr))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Find the memory range the main executable is loaded at.
///
/// Reads this process's maps and merges all mappings backed by the current
/// executable into one `[min start, max end)` range. Subtracting its start
/// from a sampled address yields the file-relative address DWARF speaks.
///
/// # Errors
/// Returns an error if the maps cannot be read or the executable does not
/// appear in them.
pub fn main_executable_range() -> Result<MemoryRange> {
    let exe = std::env::current_exe().context("Failed to resolve /proc/self/exe")?;
    let exe = exe.to_string_lossy();

    let maps = fs::read_to_string("/proc/self/maps").context("Failed to read /proc/self/maps")?;

    let mut start_addr: Option<u64> = None;
    let mut end_addr: Option<u64> = None;

    for line in maps.lines() {
        if !line.ends_with(exe.as_ref()) {
            continue;
        }
        let Some(range) = line.split_whitespace().next() else {
            continue;
        };
        if let Some((start, end)) = parse_range(range) {
            start_addr = Some(start_addr.map_or(start, |s| s.min(start)));
            end_addr = Some(end_addr.map_or(end, |e| e.max(end)));
        }
    }

    match (start_addr, end_addr) {
        (Some(start), Some(end)) => {
            info!(
                "Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)",
                start,
                end,
                (end - start) / 1024
            );
            Ok(MemoryRange { start, end })
        }
        _ => Err(anyhow::anyhow!("Could not find memory range for {exe}")),
    }
}

fn parse_range(range: &str) -> Option<(u64, u64)> {
    let (start, end) = range.split_once('-')?;
    Some((u64::from_str_radix(start, 16).ok()?, u64::from_str_radix(end, 16).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0x2001));
    }

    #[test]
    fn test_code_map_contains_own_code() {
        let map = CodeMap::load().unwrap();
        assert!(!map.is_empty());

        // The address of a function in this crate must be executable code
        let f = test_code_map_contains_own_code as usize as u64;
        assert!(map.contains(f), "own function address 0x{f:x} not in code map");
    }

    #[test]
    fn test_code_map_rejects_stack_address() {
        let map = CodeMap::load().unwrap();
        let local = 0u8;
        let addr = std::ptr::addr_of!(local) as u64;
        assert!(!map.contains(addr), "stack address 0x{addr:x} claimed executable");
    }

    #[test]
    fn test_main_executable_range_covers_own_code() {
        let range = main_executable_range().unwrap();
        assert!(range.start < range.end);

        let f = test_main_executable_range_covers_own_code as usize as u64;
        assert!(range.contains(f), "own function address 0x{f:x} outside executable range");
    }
}
