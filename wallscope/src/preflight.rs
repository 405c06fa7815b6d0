//! Pre-flight checks for wallscope
//!
//! Validates system requirements before the sampler starts.
//! Provides clear, actionable error messages when requirements aren't met.

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;

use crate::os;
use crate::sampling::SAMPLE_SIGNAL;

/// Run all pre-flight checks before sampling starts
pub fn run_preflight_checks(quiet: bool) -> Result<()> {
    check_proc_task_access()?;
    check_signal_disposition(quiet)?;
    check_debug_symbols(quiet)?;
    Ok(())
}

/// Check that this process's thread list is readable.
///
/// The sampler enumerates targets from `/proc/self/task`; without it there
/// is nothing to sample.
fn check_proc_task_access() -> Result<()> {
    let path = Path::new("/proc/self/task");
    if !path.is_dir() {
        bail!(
            "Cannot access /proc/self/task.\n\n\
             wallscope needs the proc filesystem to enumerate threads.\n\
             Is /proc mounted? (mount -t proc proc /proc)"
        );
    }
    std::fs::read_dir(path).context("Failed to read /proc/self/task")?;
    Ok(())
}

/// Warn when something else already handles the sample signal.
///
/// Installing our handler displaces any existing one, which can break the
/// host application. Worth a warning, not a refusal.
fn check_signal_disposition(quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let disposition = os::query_signal_disposition(SAMPLE_SIGNAL)
        .context("Failed to query the sample signal's disposition")?;

    if disposition != libc::SIG_DFL && disposition != libc::SIG_IGN {
        eprintln!("warning: SIGVTALRM already has a handler; sampling will replace it");
    }
    Ok(())
}

/// Check if our own binary has debug symbols for hotspot resolution
fn check_debug_symbols(quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let exe = std::env::current_exe().context("Failed to resolve /proc/self/exe")?;
    let file_data =
        std::fs::read(&exe).with_context(|| format!("Failed to read binary: {}", exe.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not a parseable object file, let the symbolizer complain later
        return Ok(());
    };

    // .debug_info carries DWARF; .symtab survives in non-stripped binaries
    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info && !has_symtab {
        eprintln!("warning: binary stripped, hotspots will show addresses only");
    } else if !has_debug_info {
        eprintln!("warning: no DWARF debug info, source locations unavailable");
    }

    Ok(())
}
