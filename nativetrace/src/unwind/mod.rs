//! # Native Stack Unwinding
//!
//! Walks the native call stack of the calling thread, either from the live
//! registers of the caller or from the interrupted state a signal handler
//! received, and records one instruction address per frame.
//!
//! ## How a frame is stepped
//!
//! ```text
//! pc ──lookup──▶ FrameDesc { cfa rule, fp rule, ra rule }
//!                   │
//!                   ▼
//!   cfa = sp|fp + offset          (caller's sp before the call)
//!   ra  = *(cfa + ra_offset)      (or lr on the first aarch64 frame)
//!   fp  = *(cfa + fp_offset)      (or unchanged)
//! ```
//!
//! Rules come from the precompiled [`tables`]; code without CFI is walked
//! with the frame-pointer rule. Lookups use `pc - 1` for every frame but an
//! interrupted one, because a return address may already belong to the next
//! function.
//!
//! ## Signal safety
//!
//! [`unwind`] with a signal context, [`Cursor`] and everything they call
//! are async-signal-safe: no allocation, no locks, no logging, bounded
//! stack use. Starting without a signal context may compile unwind tables
//! first and therefore must not happen inside a signal handler.
//!
//! Supported targets are Linux on x86_64 and aarch64; elsewhere every walk
//! yields zero frames.

pub(crate) mod memory;
pub mod registers;
pub mod tables;

use std::ffi::c_void;
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::context;
use crate::domain::CallContext;
use crate::gate;
use crate::stats::{self, Counter};

use memory::{StackReader, WORD};
pub use registers::Registers;
use tables::{Cfa, FrameDesc, Saved};

/// Smallest address accepted as code
pub const MIN_VALID_PC: usize = 0x1000;

/// Furthest a walk may go above its starting stack pointer
pub const MAX_WALK_SIZE: usize = 0x10_0000;

/// Largest single stack frame accepted
pub const MAX_FRAME_SIZE: usize = 0x4_0000;

/// One recorded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Instruction pointer: the interrupted instruction for a signal frame,
    /// a return address otherwise
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
}

/// One unwind call: where to start and where to put the addresses
///
/// Lives on the caller's stack for the duration of [`unwind`]; only the
/// buffer, the count and the optional counter are written.
pub struct UnwindRequest<'a> {
    sig_context: *const c_void,
    buf: &'a mut [usize],
    count: usize,
    context: CallContext,
    signal_samples: Option<&'a AtomicUsize>,
}

impl<'a> UnwindRequest<'a> {
    /// Request starting at the caller of [`unwind`] with `buf.len()` capacity
    #[must_use]
    pub fn new(buf: &'a mut [usize]) -> Self {
        Self {
            sig_context: std::ptr::null(),
            buf,
            count: 0,
            context: CallContext::NULL,
            signal_samples: None,
        }
    }

    /// Answers from the boundary stack cached for `context` when non-null
    #[must_use]
    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    /// Starts from the interrupted state in `ucontext` instead of the caller
    ///
    /// # Safety
    /// `ucontext` must be null or the `ucontext_t` passed to a signal handler
    /// that is still running on this thread.
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn with_signal_context(mut self, ucontext: *const c_void) -> Self {
        self.sig_context = ucontext;
        self
    }

    /// Counter bumped once for every trace produced from a signal context
    #[must_use]
    pub fn with_signal_counter(mut self, counter: &'a AtomicUsize) -> Self {
        self.signal_samples = Some(counter);
        self
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of addresses written by the last [`unwind`]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.buf[..self.count]
    }
}

/// Walks frames upwards from a starting register state
pub struct Cursor {
    regs: Registers,
    /// `regs.pc` is an interrupted instruction rather than a return address
    exact: bool,
    reader: StackReader,
    /// Highest stack pointer the walk may reach
    top: usize,
    done: bool,
}

impl Cursor {
    /// Cursor whose first frame is `regs`
    ///
    /// `interrupted` is true when `regs` come from a signal context.
    #[must_use]
    pub fn new(regs: Registers, interrupted: bool) -> Self {
        let top = regs.sp.saturating_add(MAX_WALK_SIZE);
        let reader = StackReader::new(regs.sp, top);
        let done = regs.pc < MIN_VALID_PC || regs.sp % WORD != 0;
        Self { regs, exact: interrupted, reader, top, done }
    }

    /// Cursor starting at the state interrupted by a signal
    ///
    /// # Safety
    /// Same contract as [`Registers::from_ucontext`].
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn from_ucontext(ucontext: *const c_void) -> Option<Self> {
        // SAFETY: forwarded to the caller.
        unsafe { Registers::from_ucontext(ucontext) }.map(|regs| Self::new(regs, true))
    }

    /// Register state of the caller of the current frame, or `None` when the
    /// walk cannot continue
    fn step(&self) -> Option<Registers> {
        let Registers { pc, sp, fp, lr } = self.regs;
        let probe = if self.exact { pc } else { pc - 1 };
        let desc = tables::lookup(probe).unwrap_or(FrameDesc::FRAME_POINTER);

        let cfa = match desc.cfa {
            Cfa::Sp(off) => offset(sp, off)?,
            Cfa::Fp(_) if fp == 0 => return None,
            Cfa::Fp(off) => offset(fp, off)?,
            Cfa::Plt(off) => offset(sp, off)? + if pc & 15 >= 11 { WORD } else { 0 },
            Cfa::Unsupported => return None,
        };
        // Only an interrupted leaf may share its caller's stack pointer
        if cfa < sp || (cfa == sp && !self.exact) || cfa - sp > MAX_FRAME_SIZE || cfa % WORD != 0 {
            return None;
        }
        if cfa > self.top {
            return None;
        }

        let ra = match desc.ra {
            Saved::At(off) => self.reader.read_word(offset(cfa, off)?)?,
            Saved::Unchanged => lr,
            Saved::Lost => return None,
        };
        let ra = strip_pointer_auth(ra);
        if ra < MIN_VALID_PC {
            return None;
        }
        let fp = match desc.fp {
            Saved::At(off) => self.reader.read_word(offset(cfa, off)?)?,
            Saved::Unchanged => fp,
            Saved::Lost => 0,
        };

        Some(Registers { pc: ra, sp: cfa, fp, lr: 0 })
    }
}

impl Iterator for Cursor {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let frame = Frame { ip: self.regs.pc, sp: self.regs.sp, fp: self.regs.fp };
        match self.step() {
            Some(next) => {
                self.regs = next;
                self.exact = false;
            }
            None => self.done = true,
        }
        Some(frame)
    }
}

#[inline]
fn offset(base: usize, off: i32) -> Option<usize> {
    isize::try_from(off).ok().and_then(|off| base.checked_add_signed(off))
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn strip_pointer_auth(addr: usize) -> usize {
    // Return addresses may carry a PAC in the bits above the 48-bit VA
    addr & 0x0000_ffff_ffff_ffff
}

#[cfg(not(target_arch = "aarch64"))]
#[inline]
fn strip_pointer_auth(addr: usize) -> usize {
    addr
}

/// Copies frame addresses into `buf`; returns how many were written and
/// whether more frames were left over
fn record(frames: impl Iterator<Item = Frame>, buf: &mut [usize]) -> (usize, bool) {
    let mut n = 0;
    for frame in frames {
        if n == buf.len() {
            return (n, true);
        }
        buf[n] = frame.ip;
        n += 1;
    }
    (n, false)
}

/// Walks from the caller of this function, dropping the first `skip`
/// frames (`skip == 0` starts at the immediate caller)
#[inline(never)]
pub(crate) fn walk_stack(buf: &mut [usize], skip: usize) -> (usize, bool) {
    let Some(regs) = Registers::current() else {
        return (0, false);
    };
    // `regs` describe this function's own frame
    let walked = record(Cursor::new(regs, false).skip(skip.saturating_add(1)), buf);
    black_box(walked)
}

/// Fills `req` with the native stack
///
/// Without a signal context the first address is the return address into
/// the caller of `unwind`. With a context token the boundary stack cached
/// when that token was created is returned instead, truncated to capacity.
/// Never fails: anything that stops the walk just shortens the result.
#[inline(never)]
pub fn unwind(req: &mut UnwindRequest<'_>) {
    req.count = 0;
    if !gate::is_enabled() || req.buf.is_empty() {
        return;
    }

    if !req.context.is_null() {
        req.count = context::boundary_stack(req.context, req.buf);
        stats::incr(Counter::ContextTraces);
        stats::incr(Counter::Traces);
        return;
    }

    let (count, truncated) = if req.sig_context.is_null() {
        memory::probe_thread_stack();
        tables::ensure_current();
        walk_stack(req.buf, 1)
    } else {
        // SAFETY: `with_signal_context` requires a live handler's ucontext.
        #[allow(unsafe_code)]
        let cursor = unsafe { Cursor::from_ucontext(req.sig_context) };
        let walked = cursor.map_or((0, false), |cursor| record(cursor, req.buf));
        stats::incr(Counter::SignalTraces);
        if let Some(counter) = req.signal_samples {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        walked
    };

    req.count = count;
    stats::incr(Counter::Traces);
    if truncated {
        stats::incr(Counter::TruncatedTraces);
    }
}

/// Records the caller's native stack into `buf` and returns the count
///
/// Not signal-safe (may compile unwind tables on first use).
#[inline(never)]
pub fn capture(buf: &mut [usize]) -> usize {
    if !gate::is_enabled() || buf.is_empty() {
        return 0;
    }
    memory::probe_thread_stack();
    tables::ensure_current();
    let (count, _) = walk_stack(buf, 1);
    black_box(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset() {
        assert_eq!(offset(0x100, 16), Some(0x110));
        assert_eq!(offset(0x100, -8), Some(0xf8));
        assert_eq!(offset(4, -8), None);
    }

    #[test]
    fn test_record_reports_truncation() {
        let frames = (1..=5).map(|i| Frame { ip: i * 0x1000, sp: 0, fp: 0 });
        let mut buf = [0usize; 3];
        assert_eq!(record(frames.clone(), &mut buf), (3, true));
        assert_eq!(buf, [0x1000, 0x2000, 0x3000]);

        let mut big = [0usize; 8];
        assert_eq!(record(frames, &mut big), (5, false));
    }

    #[test]
    fn test_cursor_rejects_implausible_start() {
        let mut cursor = Cursor::new(Registers { pc: 0x10, sp: 0x7000, fp: 0, lr: 0 }, true);
        assert_eq!(cursor.next(), None);

        let mut cursor = Cursor::new(Registers { pc: 0x40_0000, sp: 0x7003, fp: 0, lr: 0 }, true);
        assert_eq!(cursor.next(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cursor_follows_frame_records() {
        // Two synthetic frame records outside any module: {saved fp, ra}
        let mut stack = [0usize; 8];
        let base = stack.as_ptr() as usize;
        stack[2] = base + 4 * WORD; // frame 1: fp -> frame 2 record
        stack[3] = 0x5555_0000; // return address into frame 1's caller
        stack[4] = 0; // frame 2: end of chain
        stack[5] = 0x5555_1000;

        let regs = Registers { pc: 0x5554_0000, sp: base, fp: base + 2 * WORD, lr: 0 };
        let ips: Vec<usize> = Cursor::new(regs, true).map(|f| f.ip).collect();

        assert_eq!(ips, vec![0x5554_0000, 0x5555_0000, 0x5555_1000]);
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn test_capture_is_bounded() {
        let mut buf = [0usize; 4];
        let n = capture(&mut buf);
        assert!(n <= 4);
        assert!(n > 0);
        assert!(buf[..n].iter().all(|&pc| pc >= MIN_VALID_PC));
    }

    #[test]
    fn test_walk_with_huge_skip_records_nothing() {
        let mut buf = [0usize; 8];
        assert_eq!(walk_stack(&mut buf, usize::MAX), (0, false));
    }
}
