//! Context tracker
//!
//! Hands out a token each time native code is entered and takes it back when
//! the call returns. A token is the address of a slot in a per-thread pool;
//! entering also caches the native stack at the boundary in that slot, so a
//! later traceback carrying the token can answer without walking.
//!
//! Pools are heap-allocated on a thread's first `enter` and handed back to a
//! spare list when the thread exits; they are never freed. Slots hold only
//! atomics, so a token that leaks to another thread can still be read
//! without undefined behavior.

use std::cell::Cell;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::config::{DEFAULT_CONTEXT_SKIP, MAX_CONTEXT_SKIP};
use crate::domain::CallContext;
use crate::gate;
use crate::stats::{self, Counter};
use crate::unwind::{self, memory, tables};

/// Slots per thread: the deepest supported nesting of native calls
pub const POOL_SIZE: usize = 256;

/// Addresses cached per boundary stack
pub const BOUNDARY_FRAMES: usize = 32;

const SLOT_MAGIC: usize = 0x6e74_6378;
const FREE: usize = 0;
const HELD: usize = 1;

static SKIP: AtomicUsize = AtomicUsize::new(DEFAULT_CONTEXT_SKIP);

/// Spare pools returned by exited threads
static SPARE: Mutex<Vec<&'static Pool>> = Mutex::new(Vec::new());

// Word layout is read back with fault-tolerant loads for foreign tokens
#[repr(C)]
struct Slot {
    magic: usize,
    state: AtomicUsize,
    len: AtomicUsize,
    pcs: [AtomicUsize; BOUNDARY_FRAMES],
}

impl Slot {
    const fn new() -> Self {
        Self {
            magic: SLOT_MAGIC,
            state: AtomicUsize::new(FREE),
            len: AtomicUsize::new(0),
            pcs: [const { AtomicUsize::new(0) }; BOUNDARY_FRAMES],
        }
    }

    fn store(&self, pcs: &[usize]) {
        let n = pcs.len().min(BOUNDARY_FRAMES);
        for (slot, &pc) in self.pcs.iter().zip(&pcs[..n]) {
            slot.store(pc, Ordering::Relaxed);
        }
        self.len.store(n, Ordering::Release);
    }

    fn copy_to(&self, out: &mut [usize]) -> usize {
        let n = self.len.load(Ordering::Acquire).min(BOUNDARY_FRAMES).min(out.len());
        for (dst, src) in out.iter_mut().zip(&self.pcs[..n]) {
            *dst = src.load(Ordering::Relaxed);
        }
        n
    }

    fn release(&self) -> bool {
        self.len.store(0, Ordering::Relaxed);
        self.state.compare_exchange(HELD, FREE, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }
}

struct Pool {
    slots: [Slot; POOL_SIZE],
}

impl Pool {
    const fn new() -> Self {
        Self { slots: [const { Slot::new() }; POOL_SIZE] }
    }

    fn acquire(&self) -> Option<&Slot> {
        self.slots.iter().find(|slot| {
            slot.state.compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed).is_ok()
        })
    }

    fn slot(&self, token: CallContext) -> Option<&Slot> {
        let base = self.slots.as_ptr() as usize;
        let offset = token.0.checked_sub(base)?;
        let size = size_of::<Slot>();
        if offset % size != 0 {
            return None;
        }
        self.slots.get(offset / size)
    }

    fn held(&self) -> usize {
        self.slots.iter().filter(|s| s.state.load(Ordering::Relaxed) == HELD).count()
    }

    fn reset(&self) {
        for slot in &self.slots {
            slot.len.store(0, Ordering::Relaxed);
            slot.state.store(FREE, Ordering::Release);
        }
    }
}

/// Returns this thread's pool to the spare list on thread exit
struct PoolLease {
    pool: Cell<Option<&'static Pool>>,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = POOL.try_with(|p| p.set(ptr::null()));
            pool.reset();
            SPARE.lock().unwrap_or_else(PoisonError::into_inner).push(pool);
        }
    }
}

thread_local! {
    /// Read from signal handlers; no destructor so it is always accessible
    static POOL: Cell<*const Pool> = const { Cell::new(ptr::null()) };
    static LEASE: PoolLease = const { PoolLease { pool: Cell::new(None) } };
}

#[allow(unsafe_code)]
fn own_pool() -> Option<&'static Pool> {
    let ptr = POOL.try_with(Cell::get).ok()?;
    // SAFETY: pools are leaked, and POOL only ever holds a leased pool.
    (!ptr.is_null()).then(|| unsafe { &*ptr })
}

/// This thread's pool, leasing one on first use. Not signal-safe.
fn lease_pool() -> Option<&'static Pool> {
    if let Some(pool) = own_pool() {
        return Some(pool);
    }
    let spare = SPARE.lock().unwrap_or_else(PoisonError::into_inner).pop();
    let pool: &'static Pool = spare.unwrap_or_else(|| Box::leak(Box::new(Pool::new())));
    if LEASE.try_with(|lease| lease.pool.set(Some(pool))).is_err() {
        // Thread is being torn down
        SPARE.lock().unwrap_or_else(PoisonError::into_inner).push(pool);
        return None;
    }
    POOL.with(|p| p.set(pool));
    Some(pool)
}

pub(crate) fn set_skip(skip: usize) {
    SKIP.store(skip.min(MAX_CONTEXT_SKIP), Ordering::Relaxed);
}

/// Marks entry into native code
///
/// A null `existing` token allocates a new one and caches the native stack
/// above the boundary (skipping this function and the configured number of
/// caller frames). A non-null token is returned unchanged. Returns the null
/// token when the gate is closed or this thread's pool is exhausted.
#[inline(never)]
#[must_use]
pub fn enter(existing: CallContext) -> CallContext {
    if !existing.is_null() {
        return existing;
    }
    if !gate::is_enabled() {
        return CallContext::NULL;
    }
    let Some(pool) = lease_pool() else {
        return CallContext::NULL;
    };
    let Some(slot) = pool.acquire() else {
        stats::incr(Counter::PoolExhausted);
        return CallContext::NULL;
    };

    memory::probe_thread_stack();
    tables::ensure_current();
    let mut pcs = [0usize; BOUNDARY_FRAMES];
    let (n, _) = unwind::walk_stack(&mut pcs, SKIP.load(Ordering::Relaxed).saturating_add(1));
    slot.store(&pcs[..n]);

    stats::incr(Counter::ContextsCreated);
    CallContext(ptr::from_ref(slot) as usize)
}

/// Marks the return from the native call bracketed by `token`
///
/// Releasing a token this thread does not hold is ignored. Releases are
/// honored even while the gate is closed so slots are never stranded.
pub fn leave(token: CallContext) {
    if token.is_null() {
        return;
    }
    let released = own_pool().and_then(|pool| pool.slot(token)).is_some_and(Slot::release);
    if !released {
        stats::incr(Counter::MismatchedLeaves);
        debug!("Ignoring release of {token}: not held by this thread");
    }
}

/// Number of tokens currently held by this thread
#[must_use]
pub fn held() -> usize {
    own_pool().map_or(0, Pool::held)
}

/// Copies the boundary stack cached for `token` into `out`
///
/// Async-signal-safe. Tokens of other threads are read with fault-tolerant
/// loads and validated against the slot marker; anything unrecognized
/// yields zero frames.
pub(crate) fn boundary_stack(token: CallContext, out: &mut [usize]) -> usize {
    if let Some(slot) = own_pool().and_then(|pool| pool.slot(token)) {
        if slot.state.load(Ordering::Acquire) != HELD {
            return 0;
        }
        return slot.copy_to(out);
    }
    foreign_boundary_stack(token.0, out)
}

fn foreign_boundary_stack(addr: usize, out: &mut [usize]) -> usize {
    const WORD: usize = size_of::<usize>();

    if addr % std::mem::align_of::<Slot>() != 0 {
        return 0;
    }
    let word = |i: usize| memory::read_word_checked(addr.checked_add(i * WORD)?);
    if word(0) != Some(SLOT_MAGIC) || word(1) != Some(HELD) {
        return 0;
    }
    let Some(len) = word(2) else {
        return 0;
    };

    let n = len.min(BOUNDARY_FRAMES).min(out.len());
    for (i, dst) in out[..n].iter_mut().enumerate() {
        match word(3 + i) {
            Some(pc) => *dst = pc,
            None => return i,
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_passes_existing_token_through() {
        let token = CallContext(0xdead_0000);
        assert_eq!(enter(token), token);
    }

    #[test]
    fn test_enter_leave_balances() {
        let before = held();
        let token = enter(CallContext::NULL);
        assert!(!token.is_null());
        assert_eq!(held(), before + 1);

        leave(token);
        assert_eq!(held(), before);
    }

    #[test]
    fn test_leave_unknown_token_is_ignored() {
        let before = stats::snapshot().mismatched_leaves;
        leave(CallContext(0x1234_5678));
        leave(CallContext(0x8));
        assert!(stats::snapshot().mismatched_leaves >= before + 2);
    }

    #[test]
    fn test_double_leave_is_ignored() {
        let token = enter(CallContext::NULL);
        leave(token);
        let before = held();
        leave(token);
        assert_eq!(held(), before);
    }

    #[test]
    fn test_pool_exhaustion_yields_null() {
        let mut tokens = Vec::new();
        loop {
            let token = enter(CallContext::NULL);
            if token.is_null() {
                break;
            }
            tokens.push(token);
            assert!(tokens.len() <= POOL_SIZE);
        }
        assert_eq!(held(), POOL_SIZE);
        for token in tokens.into_iter().rev() {
            leave(token);
        }
        assert_eq!(held(), 0);
    }

    #[test]
    fn test_foreign_token_is_read_safely() {
        let token = enter(CallContext::NULL);
        let mut own = [0usize; BOUNDARY_FRAMES];
        let n = boundary_stack(token, &mut own);

        let handle = std::thread::spawn(move || {
            let mut out = [0usize; BOUNDARY_FRAMES];
            let m = boundary_stack(token, &mut out);
            (m, out)
        });
        let (m, out) = handle.join().unwrap();
        if cfg!(target_os = "linux") {
            assert_eq!(m, n);
            assert_eq!(out[..m], own[..n]);
        }
        leave(token);

        let mut out = [0usize; 4];
        assert_eq!(foreign_boundary_stack(0x10, &mut out), 0);
    }
}
