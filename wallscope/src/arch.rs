//! Architecture-specific register and instruction decoding
//!
//! Thread-state classification needs three things from the target
//! architecture: where the program counter and syscall return value live in
//! a signal `ucontext`, what the syscall instruction looks like in memory,
//! and how long it is. Everything else in the engine is arch-neutral.

#![allow(unsafe_code)] // reads registers out of raw ucontext pointers

/// Registers captured by the kernel when a signal interrupted a thread.
///
/// A cheap read-only view; the underlying `ucontext_t` stays owned by the
/// signal frame it was delivered with.
#[derive(Clone, Copy)]
pub struct Frame {
    uc: *const libc::ucontext_t,
}

impl Frame {
    /// Wrap the `ucontext` pointer a signal handler received.
    ///
    /// # Safety
    /// `ucontext` must be the third argument of an `SA_SIGINFO` handler
    /// invocation and must stay valid for the lifetime of the `Frame`.
    #[must_use]
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Self {
        Self { uc: ucontext.cast() }
    }

    /// Program counter at the point of interruption.
    #[must_use]
    pub fn pc(&self) -> u64 {
        // SAFETY: from_ucontext's contract guarantees uc points at a live
        // kernel-written ucontext_t.
        unsafe { imp::pc(self.uc) }
    }

    /// Value of the syscall return register at the point of interruption.
    ///
    /// Only meaningful if the thread was actually inside or just past a
    /// syscall; interpreting it is the caller's job.
    #[must_use]
    pub fn syscall_return(&self) -> i64 {
        // SAFETY: as above.
        unsafe { imp::syscall_return(self.uc) }
    }
}

/// Byte length of the syscall instruction.
pub const SYSCALL_SIZE: u64 = imp::SYSCALL_SIZE;

/// Whether the instruction at `addr` is the syscall instruction.
///
/// # Safety
/// `addr..addr + SYSCALL_SIZE` must be readable memory.
#[must_use]
pub unsafe fn is_syscall_instruction(addr: u64) -> bool {
    imp::is_syscall_instruction(addr as *const u8)
}

/// Kernel codes left in the return register when a signal lands mid-syscall.
///
/// `EINTR` when the syscall will not be resumed, or one of the (kernel
/// internal, hence spelled out here) `ERESTART*` codes when it would have
/// been restarted. Seeing any of these right after a syscall instruction
/// means the thread was blocked in the kernel when we interrupted it.
#[must_use]
pub fn is_interrupted_syscall_return(ret: i64) -> bool {
    const ERESTARTSYS: i64 = 512;
    const ERESTARTNOINTR: i64 = 513;
    const ERESTARTNOHAND: i64 = 514;
    const ERESTART_RESTARTBLOCK: i64 = 516;

    matches!(
        -ret,
        x if x == i64::from(libc::EINTR)
            || x == ERESTARTSYS
            || x == ERESTARTNOINTR
            || x == ERESTARTNOHAND
            || x == ERESTART_RESTARTBLOCK
    )
}

#[cfg(target_arch = "x86_64")]
mod imp {
    /// `syscall` encodes as 0F 05
    pub const SYSCALL_SIZE: u64 = 2;

    pub unsafe fn is_syscall_instruction(addr: *const u8) -> bool {
        *addr == 0x0f && *addr.add(1) == 0x05
    }

    #[allow(clippy::cast_sign_loss)] // greg_t is i64, addresses are not negative
    pub unsafe fn pc(uc: *const libc::ucontext_t) -> u64 {
        (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    }

    pub unsafe fn syscall_return(uc: *const libc::ucontext_t) -> i64 {
        (*uc).uc_mcontext.gregs[libc::REG_RAX as usize]
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    /// `svc #0` encodes as the little-endian word D4000001
    pub const SYSCALL_SIZE: u64 = 4;

    pub unsafe fn is_syscall_instruction(addr: *const u8) -> bool {
        // Byte-wise compare; synthetic buffers in tests are not 4-byte aligned
        *addr == 0x01 && *addr.add(1) == 0x00 && *addr.add(2) == 0x00 && *addr.add(3) == 0xd4
    }

    pub unsafe fn pc(uc: *const libc::ucontext_t) -> u64 {
        (*uc).uc_mcontext.pc
    }

    #[allow(clippy::cast_possible_wrap)] // x0 carries a signed syscall result here
    pub unsafe fn syscall_return(uc: *const libc::ucontext_t) -> i64 {
        (*uc).uc_mcontext.regs[0] as i64
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("wallscope only supports x86_64 and aarch64 Linux targets");
