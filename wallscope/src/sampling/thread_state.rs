//! Thread-state classification from an interrupted execution context
//!
//! A freshly interrupted thread was either on CPU or blocked in the kernel.
//! The kernel does not hand us that bit directly, but it leaves two usable
//! traces: a thread parked in a syscall reports a program counter sitting on
//! the syscall instruction, and a thread whose syscall was just aborted by
//! our own signal reports the instruction after it together with an
//! interrupted-syscall code in the return register.

#![allow(unsafe_code)] // probes instruction bytes at sampled addresses

use std::fmt;

use crate::arch;

/// What a thread was doing when the sample signal interrupted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// On CPU (or at least not observably blocked in the kernel)
    Running,
    /// Blocked in a syscall when the signal arrived
    Sleeping,
    /// Classification was not attempted (idle sampling disabled)
    Unknown,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Running => write!(f, "running"),
            ThreadState::Sleeping => write!(f, "sleeping"),
            ThreadState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify an interrupted thread from its program counter and syscall
/// return register.
///
/// Sleeping if `pc` sits on a syscall instruction, or if the instruction
/// just before `pc` is a syscall instruction and the return register holds
/// an interrupted-syscall code. The preceding instruction is only probed
/// when it is provably readable: on the same page as `pc`, or inside a
/// region `in_known_code` vouches for.
///
/// # Safety
/// `pc` must be a readable instruction address (the address an interrupted
/// thread was executing), and `in_known_code` must only return true for
/// address ranges that are mapped readable.
pub unsafe fn classify_pc(
    pc: u64,
    syscall_return: i64,
    in_known_code: impl Fn(u64) -> bool,
) -> ThreadState {
    if arch::is_syscall_instruction(pc) {
        return ThreadState::Sleeping;
    }

    // The preceding instruction may sit on an unmapped page; probe it only
    // when it shares pc's page or the code map vouches for it
    let prev_pc = pc.wrapping_sub(arch::SYSCALL_SIZE);
    let prev_readable = (pc & 0xfff) >= arch::SYSCALL_SIZE || in_known_code(prev_pc);
    if prev_readable
        && arch::is_syscall_instruction(prev_pc)
        && arch::is_interrupted_syscall_return(syscall_return)
    {
        return ThreadState::Sleeping;
    }

    ThreadState::Running
}

/// Classify directly from a captured register [`arch::Frame`].
///
/// # Safety
/// The frame must wrap a live signal `ucontext` whose program counter is a
/// readable address, and `in_known_code` must only vouch for mapped memory.
pub unsafe fn classify_frame(frame: &arch::Frame, in_known_code: impl Fn(u64) -> bool) -> ThreadState {
    classify_pc(frame.pc(), frame.syscall_return(), in_known_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests feed heap buffers as fake code. Page-offset readability of the
    // preceding instruction depends on where the allocator put the buffer,
    // so every test that needs the prev-instruction probe passes a code map
    // that vouches for everything.

    fn never(_: u64) -> bool {
        false
    }

    fn always(_: u64) -> bool {
        true
    }

    #[cfg(target_arch = "x86_64")]
    const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];
    #[cfg(target_arch = "aarch64")]
    const SYSCALL_INSN: [u8; 4] = [0x01, 0x00, 0x00, 0xd4];

    const NOP: u8 = 0x90;

    #[test]
    fn test_pc_on_syscall_is_sleeping() {
        let mut code = vec![NOP; 8];
        code[..SYSCALL_INSN.len()].copy_from_slice(&SYSCALL_INSN);
        let pc = code.as_ptr() as u64;
        // SAFETY: pc points into `code`
        let state = unsafe { classify_pc(pc, 0, never) };
        assert_eq!(state, ThreadState::Sleeping);
    }

    #[test]
    fn test_pc_after_syscall_with_eintr_is_sleeping() {
        let mut code = vec![NOP; 16];
        code[..SYSCALL_INSN.len()].copy_from_slice(&SYSCALL_INSN);
        let pc = code.as_ptr() as u64 + arch::SYSCALL_SIZE;
        // SAFETY: pc and pc - SYSCALL_SIZE point into `code`
        let state = unsafe { classify_pc(pc, -i64::from(libc::EINTR), always) };
        assert_eq!(state, ThreadState::Sleeping);
    }

    #[test]
    fn test_pc_after_syscall_with_clean_return_is_running() {
        let mut code = vec![NOP; 16];
        code[..SYSCALL_INSN.len()].copy_from_slice(&SYSCALL_INSN);
        let pc = code.as_ptr() as u64 + arch::SYSCALL_SIZE;
        // SAFETY: pc and pc - SYSCALL_SIZE point into `code`
        let state = unsafe { classify_pc(pc, 0, always) };
        assert_eq!(state, ThreadState::Running);
    }

    #[test]
    fn test_plain_code_is_running_even_with_eintr_in_register() {
        // No syscall instruction anywhere near pc: a stale EINTR-looking
        // value in the return register must not classify as sleeping
        let code = vec![NOP; 16];
        let pc = code.as_ptr() as u64 + arch::SYSCALL_SIZE;
        // SAFETY: pc and pc - SYSCALL_SIZE point into `code`
        let state = unsafe { classify_pc(pc, -i64::from(libc::EINTR), always) };
        assert_eq!(state, ThreadState::Running);
    }

    /// Two mapped pages, page-aligned, so a pc placed exactly on the second
    /// page boundary exercises the cross-page readability gate without any
    /// actual unmapped memory nearby.
    struct PageBuf {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    }

    impl PageBuf {
        fn new() -> Self {
            let layout = std::alloc::Layout::from_size_align(8192, 4096).unwrap();
            // SAFETY: layout has non-zero size
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        /// pc sitting on the second page boundary, with a syscall
        /// instruction ending exactly at that boundary.
        fn boundary_pc_after_syscall(&self) -> u64 {
            let insn_at = 4096 - SYSCALL_INSN.len();
            // SAFETY: writes stay inside the allocation
            unsafe {
                std::ptr::copy_nonoverlapping(
                    SYSCALL_INSN.as_ptr(),
                    self.ptr.add(insn_at),
                    SYSCALL_INSN.len(),
                );
                self.ptr.add(4096) as u64
            }
        }
    }

    impl Drop for PageBuf {
        fn drop(&mut self) {
            // SAFETY: same layout the buffer was allocated with
            unsafe { std::alloc::dealloc(self.ptr, self.layout) }
        }
    }

    #[test]
    fn test_cross_page_probe_requires_known_code() {
        let buf = PageBuf::new();
        let pc = buf.boundary_pc_after_syscall();
        assert_eq!(pc & 0xfff, 0, "pc must sit on a page boundary");

        // The preceding instruction is a syscall and the register says
        // interrupted, but with nothing vouching for the previous page the
        // probe must be skipped entirely
        // SAFETY: both pages are mapped, so any probe that does happen is a
        // valid read; the assertion checks it does not happen
        let gated = unsafe { classify_pc(pc, -i64::from(libc::EINTR), never) };
        assert_eq!(gated, ThreadState::Running);

        // Vouching for the previous page re-enables the probe
        // SAFETY: as above
        let probed = unsafe { classify_pc(pc, -i64::from(libc::EINTR), always) };
        assert_eq!(probed, ThreadState::Sleeping);
    }

    #[test]
    fn test_display() {
        assert_eq!(ThreadState::Running.to_string(), "running");
        assert_eq!(ThreadState::Sleeping.to_string(), "sleeping");
        assert_eq!(ThreadState::Unknown.to_string(), "unknown");
    }
}
