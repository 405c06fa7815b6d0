//! Thin wrappers over the Linux primitives the sampler needs
//!
//! Everything here is a direct syscall or a `/proc` read; policy (which
//! threads to signal, when, how often) lives in `sampling`.

#![allow(unsafe_code)] // raw syscalls and sigaction require unsafe

pub mod thread_list;

use std::fs;
use std::io;
use std::mem::MaybeUninit;

use crate::domain::{Pid, Tid};

/// Signature required of a sample signal handler (`SA_SIGINFO` form).
pub type SignalHandlerFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Coarse scheduler state of a thread, from `/proc/<pid>/task/<tid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The kernel reports the thread runnable (`R`)
    Running,
    /// Any non-runnable state (`S`, `D`, `T`, ...)
    Sleeping,
    /// The stat file could not be read, usually because the thread exited
    Unknown,
}

/// Current monotonic time in nanoseconds.
#[must_use]
#[allow(clippy::cast_sign_loss)] // monotonic time is never negative
pub fn nanotime() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec; CLOCK_MONOTONIC always exists.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Sleep for up to `ns` nanoseconds.
///
/// Returns early if a signal is delivered to this thread; `nanosleep` is one
/// of the calls the kernel never restarts under `SA_RESTART`, which is what
/// lets [`crate::sampling::WallClockSampler::stop`] wake the cycle thread.
pub fn sleep_ns(ns: u64) {
    #[allow(clippy::cast_possible_wrap)] // intervals are far below i64::MAX
    let req = libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    };
    // SAFETY: req is a valid timespec; the remainder out-param may be null.
    unsafe {
        libc::nanosleep(&req, std::ptr::null_mut());
    }
}

/// Kernel thread ID of the calling thread.
#[must_use]
pub fn current_thread_id() -> Tid {
    // SAFETY: gettid takes no arguments and cannot fail.
    #[allow(clippy::cast_possible_truncation)] // tids fit in i32 (pid_t)
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    Tid(tid)
}

/// Process ID of the calling process.
#[must_use]
pub fn process_id() -> Pid {
    // SAFETY: getpid takes no arguments and cannot fail.
    Pid(unsafe { libc::getpid() })
}

/// Deliver `signo` to one thread of this process via `tgkill`.
///
/// Returns false when delivery fails, which in practice means the thread
/// exited between being listed and being signalled (`ESRCH`).
pub fn send_thread_signal(tid: Tid, signo: libc::c_int) -> bool {
    // SAFETY: tgkill with our own tgid only addresses threads of this
    // process; a stale tid yields ESRCH rather than touching another process.
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid.0, signo) };
    rc == 0
}

/// Deliver `signo` to a thread addressed by its pthread handle.
///
/// Used to wake a joinable thread out of a sleep; the handle stays valid
/// until the thread is joined, exit notwithstanding.
pub fn pthread_signal(pthread: libc::pthread_t, signo: libc::c_int) -> bool {
    // SAFETY: callers pass handles of threads they still own and have not
    // joined, which is what pthread_kill requires.
    unsafe { libc::pthread_kill(pthread, signo) == 0 }
}

/// Install `handler` for `signo` process-wide with `SA_SIGINFO | SA_RESTART`.
///
/// `SA_RESTART` keeps interrupted syscalls in sampled threads transparent
/// where the kernel allows a restart.
pub fn install_signal_handler(signo: libc::c_int, handler: SignalHandlerFn) -> io::Result<()> {
    // SAFETY: sa is fully initialized before sigaction reads it; the handler
    // pointer has the SA_SIGINFO signature the flags promise.
    unsafe {
        let mut sa: libc::sigaction = MaybeUninit::zeroed().assume_init();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        if libc::sigaction(signo, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Query the current disposition of `signo` without changing it.
///
/// Returns the raw `sa_sigaction` value; `libc::SIG_DFL` / `libc::SIG_IGN`
/// mean no user handler is installed.
pub fn query_signal_disposition(signo: libc::c_int) -> io::Result<usize> {
    // SAFETY: a null new-action pointer makes sigaction a pure query.
    unsafe {
        let mut old: libc::sigaction = MaybeUninit::zeroed().assume_init();
        if libc::sigaction(signo, std::ptr::null(), &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old.sa_sigaction)
    }
}

/// Scheduler state of one thread of this process.
///
/// Parses `/proc/self/task/<tid>/stat`; the state field follows the comm
/// field, which is why we scan from the last `)` (comm may contain spaces
/// and parentheses).
#[must_use]
pub fn thread_run_state(tid: Tid) -> RunState {
    let path = format!("/proc/self/task/{}/stat", tid.0);
    let Ok(stat) = fs::read_to_string(&path) else {
        return RunState::Unknown;
    };
    let Some(close) = stat.rfind(')') else {
        return RunState::Unknown;
    };
    match stat[close + 1..].trim_start().chars().next() {
        Some('R') => RunState::Running,
        Some(_) => RunState::Sleeping,
        None => RunState::Unknown,
    }
}

/// Name (comm) of one thread of this process, if readable.
#[must_use]
pub fn thread_name(tid: Tid) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/self/task/{}/comm", tid.0)).ok()?;
    let comm = comm.trim();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanotime_is_monotonic() {
        let a = nanotime();
        let b = nanotime();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_sleep_ns_elapses() {
        let start = nanotime();
        sleep_ns(2_000_000); // 2ms
        let elapsed = nanotime() - start;
        assert!(elapsed >= 1_000_000, "slept only {elapsed}ns");
    }

    #[test]
    fn test_current_thread_id_is_positive() {
        assert!(current_thread_id().0 > 0);
    }

    #[test]
    fn test_signal_zero_probes_thread_existence() {
        // Signal 0 performs the permission/existence check without delivery
        assert!(send_thread_signal(current_thread_id(), 0));
        assert!(!send_thread_signal(Tid(0x3fff_fff0), 0));
    }

    #[test]
    fn test_own_thread_is_running() {
        // We are executing, so /proc must say R
        assert_eq!(thread_run_state(current_thread_id()), RunState::Running);
    }

    #[test]
    fn test_vanished_thread_is_unknown() {
        assert_eq!(thread_run_state(Tid(0x3fff_fff0)), RunState::Unknown);
    }

    #[test]
    fn test_thread_name_readable() {
        assert!(thread_name(current_thread_id()).is_some());
    }

    #[test]
    fn test_query_signal_disposition() {
        // SIGUSR2 is untouched by the test harness
        let disp = query_signal_disposition(libc::SIGUSR2).unwrap();
        assert!(disp == libc::SIG_DFL || disp == libc::SIG_IGN);
    }
}
