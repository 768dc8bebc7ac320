//! Stack memory access for the unwinder
//!
//! Saved registers are read from the stack being walked. Reads inside the
//! current thread's stack are plain loads; anything else goes through a
//! syscall that reports a bad address instead of faulting. Both paths are
//! async-signal-safe. The thread's stack bounds are probed lazily outside
//! signal context and cached in a destructor-free thread local.

use std::cell::Cell;
use std::mem::size_of;

pub(crate) const WORD: usize = size_of::<usize>();

thread_local! {
    /// `[low, high)` of this thread's stack, `(0, 0)` until probed
    static STACK_BOUNDS: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
    static PROBED: Cell<bool> = const { Cell::new(false) };
}

/// Records the current thread's stack bounds. Not signal-safe.
pub(crate) fn probe_thread_stack() {
    if PROBED.with(Cell::get) {
        return;
    }
    PROBED.with(|p| p.set(true));
    if let Some(bounds) = query_thread_stack() {
        STACK_BOUNDS.with(|b| b.set(bounds));
    }
}

fn thread_stack() -> (usize, usize) {
    STACK_BOUNDS.with(Cell::get)
}

#[cfg(all(target_os = "linux", any(target_env = "gnu", target_env = "musl")))]
#[allow(unsafe_code)]
fn query_thread_stack() -> Option<(usize, usize)> {
    // SAFETY: the attribute object is initialized by pthread_getattr_np
    // before use and destroyed on every path.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        let low = addr as usize;
        Some((low, low + size))
    }
}

#[cfg(not(all(target_os = "linux", any(target_env = "gnu", target_env = "musl"))))]
fn query_thread_stack() -> Option<(usize, usize)> {
    None
}

/// Bounded view of the stack being walked
///
/// Only addresses in `[low, high)` are ever read: `low` is the stack pointer
/// the walk started from and `high` caps how far up the walk may go.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackReader {
    low: usize,
    high: usize,
    /// Intersection with this thread's own stack, readable directly
    direct: (usize, usize),
}

impl StackReader {
    pub(crate) fn new(low: usize, high: usize) -> Self {
        let (stack_low, stack_high) = thread_stack();
        let direct = (low.max(stack_low), high.min(stack_high));
        Self { low, high, direct }
    }

    #[inline]
    pub(crate) fn in_bounds(&self, addr: usize) -> bool {
        addr >= self.low && addr.saturating_add(WORD) <= self.high
    }

    /// Reads one aligned word, or `None` if it is outside the walk bounds or
    /// not readable
    #[allow(unsafe_code)]
    pub(crate) fn read_word(&self, addr: usize) -> Option<usize> {
        if addr % WORD != 0 || !self.in_bounds(addr) {
            return None;
        }
        if addr >= self.direct.0 && addr + WORD <= self.direct.1 {
            // SAFETY: the address is aligned and lies between the walk's
            // starting stack pointer and the top of this thread's mapped
            // stack.
            return Some(unsafe { std::ptr::read_volatile(addr as *const usize) });
        }
        read_word_checked(addr)
    }
}

/// Reads a word anywhere in the address space without faulting
#[cfg(any(target_os = "linux", target_os = "android"))]
#[allow(unsafe_code)]
pub(crate) fn read_word_checked(addr: usize) -> Option<usize> {
    let mut value: usize = 0;
    let local = libc::iovec {
        iov_base: std::ptr::addr_of_mut!(value).cast(),
        iov_len: WORD,
    };
    let remote = libc::iovec { iov_base: addr as *mut libc::c_void, iov_len: WORD };
    // SAFETY: `local` describes `value`; the kernel validates `remote` and
    // returns an error for unmapped addresses.
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    (usize::try_from(n).ok() == Some(WORD)).then_some(value)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn read_word_checked(_addr: usize) -> Option<usize> {
    None
}
