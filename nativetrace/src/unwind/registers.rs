//! Register state that seeds a stack walk
//!
//! Only the registers the frame tables refer to are kept: program counter,
//! stack pointer, frame pointer and (on aarch64) the link register.

/// Registers of one frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
    /// Link register; always 0 on x86_64
    pub lr: usize,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
core::arch::global_asm!(
    ".pushsection .text.nativetrace_capture_registers,\"ax\",%progbits",
    ".p2align 4",
    ".globl nativetrace_capture_registers",
    ".hidden nativetrace_capture_registers",
    ".type nativetrace_capture_registers,%function",
    "nativetrace_capture_registers:",
    ".cfi_startproc",
    "mov rax, qword ptr [rsp]",
    "mov qword ptr [rdi], rax",
    "lea rax, [rsp + 8]",
    "mov qword ptr [rdi + 8], rax",
    "mov qword ptr [rdi + 16], rbp",
    "mov qword ptr [rdi + 24], 0",
    "ret",
    ".cfi_endproc",
    ".size nativetrace_capture_registers, .-nativetrace_capture_registers",
    ".popsection",
);

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
core::arch::global_asm!(
    ".pushsection .text.nativetrace_capture_registers,\"ax\",%progbits",
    ".p2align 2",
    ".globl nativetrace_capture_registers",
    ".hidden nativetrace_capture_registers",
    ".type nativetrace_capture_registers,%function",
    "nativetrace_capture_registers:",
    ".cfi_startproc",
    "str x30, [x0]",
    "mov x9, sp",
    "str x9, [x0, #8]",
    "str x29, [x0, #16]",
    "str x30, [x0, #24]",
    "ret",
    ".cfi_endproc",
    ".size nativetrace_capture_registers, .-nativetrace_capture_registers",
    ".popsection",
);

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
extern "C" {
    /// Stores the caller's state as it will be right after this call returns:
    /// `pc` is the return address, `sp` the caller's stack pointer.
    fn nativetrace_capture_registers(regs: *mut Registers);
}

impl Registers {
    /// Register state of the calling function at the instruction following
    /// this call, or `None` on unsupported targets
    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[allow(unsafe_code)]
    #[inline(always)]
    #[must_use]
    pub fn current() -> Option<Self> {
        let mut regs = Registers::default();
        // SAFETY: the routine writes exactly the four words of `regs`.
        unsafe { nativetrace_capture_registers(&mut regs) };
        Some(regs)
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    #[inline(always)]
    #[must_use]
    pub fn current() -> Option<Self> {
        None
    }

    /// Interrupted register state from a signal handler's `ucontext_t`
    ///
    /// # Safety
    /// `ucontext` must be null or point at the `ucontext_t` the kernel passed
    /// to a signal handler that is still running.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[allow(unsafe_code, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    #[must_use]
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Option<Self> {
        // Indices into `gregs`, from <sys/ucontext.h>
        const REG_RBP: usize = 10;
        const REG_RSP: usize = 15;
        const REG_RIP: usize = 16;

        if ucontext.is_null() {
            return None;
        }
        // SAFETY: guaranteed by the caller.
        let uc = unsafe { &*ucontext.cast::<libc::ucontext_t>() };
        let gregs = &uc.uc_mcontext.gregs;
        Some(Self {
            pc: gregs[REG_RIP] as usize,
            sp: gregs[REG_RSP] as usize,
            fp: gregs[REG_RBP] as usize,
            lr: 0,
        })
    }

    /// Interrupted register state from a signal handler's `ucontext_t`
    ///
    /// # Safety
    /// `ucontext` must be null or point at the `ucontext_t` the kernel passed
    /// to a signal handler that is still running.
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    #[must_use]
    pub unsafe fn from_ucontext(ucontext: *const libc::c_void) -> Option<Self> {
        if ucontext.is_null() {
            return None;
        }
        // SAFETY: guaranteed by the caller.
        let uc = unsafe { &*ucontext.cast::<libc::ucontext_t>() };
        let mc = &uc.uc_mcontext;
        Some(Self {
            pc: mc.pc as usize,
            sp: mc.sp as usize,
            fp: mc.regs[29] as usize,
            lr: mc.regs[30] as usize,
        })
    }

    /// Interrupted register state from a signal handler's `ucontext_t`
    ///
    /// # Safety
    /// Always safe on this target; no state is read.
    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn from_ucontext(_ucontext: *const std::ffi::c_void) -> Option<Self> {
        None
    }
}
