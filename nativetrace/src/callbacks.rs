//! C entry points for the host runtime's native-traceback hooks
//!
//! Thin adapters between the `#[repr(C)]` argument blocks of
//! `nativetrace-abi` and the pure operations of this crate. The host
//! registers [`nativetrace_context`], [`nativetrace_traceback`] and
//! [`nativetrace_symbolizer`] once at startup, after calling
//! [`nativetrace_init`] so the environment configuration is applied before
//! the first native call.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::{Mutex, OnceLock, PoisonError};

use nativetrace_abi::{
    ContextArg, SymbolizerArg, TracebackArg, END_OF_STACK, INTERFACE_VERSION, NO_CONTEXT,
};

use crate::context;
use crate::domain::CallContext;
use crate::symbolization::request::{PendingFrames, SymbolRequest};
use crate::unwind::{self, UnwindRequest};

/// Strings handed to the host; they must outlive every answer
static STRINGS: OnceLock<Mutex<HashMap<String, &'static CStr>>> = OnceLock::new();

fn intern(s: &str) -> *const c_char {
    let mut strings =
        STRINGS.get_or_init(Mutex::default).lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(interned) = strings.get(s) {
        return interned.as_ptr();
    }
    let owned = CString::new(s.replace('\0', "")).unwrap_or_default();
    let leaked: &'static CStr = Box::leak(owned.into_boxed_c_str());
    strings.insert(s.to_string(), leaked);
    leaked.as_ptr()
}

/// Initializes the engine from `NATIVETRACE_*` variables and returns the
/// interface version the argument blocks follow
#[no_mangle]
pub extern "C" fn nativetrace_init() -> usize {
    crate::tracer();
    INTERFACE_VERSION
}

/// Context callback: a zero token asks for a new one, anything else is the
/// release of a token handed out earlier
///
/// # Safety
/// `arg` must be null or point at a valid, writable `ContextArg`.
#[no_mangle]
#[inline(never)]
pub unsafe extern "C" fn nativetrace_context(arg: *mut ContextArg) {
    // SAFETY: guaranteed by the caller
    let Some(arg) = (unsafe { arg.as_mut() }) else {
        return;
    };
    if arg.context == NO_CONTEXT {
        arg.context = context::enter(CallContext::NULL).0;
    } else {
        context::leave(CallContext(arg.context));
    }
}

/// Traceback callback: fills `buf` with up to `max` addresses and writes
/// the end-of-stack marker after them when there is room
///
/// Async-signal-safe when `sig_context` is set.
///
/// # Safety
/// `arg` must be null or point at a valid `TracebackArg` whose `buf` holds
/// `max` writable words and whose `sig_context` is null or the
/// `ucontext_t` of the running signal handler.
#[no_mangle]
#[inline(never)]
pub unsafe extern "C" fn nativetrace_traceback(arg: *mut TracebackArg) {
    // SAFETY: guaranteed by the caller
    let Some(arg) = (unsafe { arg.as_mut() }) else {
        return;
    };
    if arg.buf.is_null() || arg.max == 0 {
        return;
    }
    // SAFETY: the host owns `max` words at `buf` for the duration of the call
    let buf = unsafe { std::slice::from_raw_parts_mut(arg.buf, arg.max) };

    let count = {
        // SAFETY: `sig_context` is null or the live handler's ucontext
        let mut req = unsafe {
            UnwindRequest::new(buf)
                .with_context(CallContext(arg.context))
                .with_signal_context(arg.sig_context.cast_const())
        };
        unwind::unwind(&mut req);
        req.count()
    };
    if count < buf.len() {
        buf[count] = END_OF_STACK;
    }
}

/// Symbolizer callback: describes `pc`, one inlined frame per call
///
/// # Safety
/// `arg` must be null or point at a valid `SymbolizerArg` whose `data` is
/// zero or the value this function stored there on the previous call.
#[no_mangle]
pub unsafe extern "C" fn nativetrace_symbolizer(arg: *mut SymbolizerArg) {
    // SAFETY: guaranteed by the caller
    let Some(arg) = (unsafe { arg.as_mut() }) else {
        return;
    };

    let mut req = SymbolRequest::new(arg.pc as u64);
    if arg.data != 0 {
        // SAFETY: `data` was produced by `Box::into_raw` below
        req.set_pending(Some(unsafe { Box::from_raw(arg.data as *mut PendingFrames) }));
        arg.data = 0;
    }

    crate::tracer().symbolize(&mut req);

    arg.func = req.function.as_deref().map_or(std::ptr::null(), intern);
    arg.file = req.file.as_deref().map_or(std::ptr::null(), intern);
    arg.lineno = req.line as usize;
    arg.entry = usize::try_from(req.entry).unwrap_or(0);
    arg.more = usize::from(req.more);
    arg.data = req.take_pending().map_or(0, |pending| Box::into_raw(pending) as usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let a = intern("nativetrace::demo");
        let b = intern("nativetrace::demo");
        assert_eq!(a, b);
        // SAFETY: interned strings live forever
        assert_eq!(unsafe { CStr::from_ptr(a) }.to_str().unwrap(), "nativetrace::demo");
    }

    #[test]
    fn test_intern_strips_nul() {
        let p = intern("a\0b");
        // SAFETY: as above
        assert_eq!(unsafe { CStr::from_ptr(p) }.to_bytes(), b"ab");
    }

    #[test]
    fn test_null_args_are_ignored() {
        // SAFETY: null is explicitly allowed
        unsafe {
            nativetrace_context(std::ptr::null_mut());
            nativetrace_traceback(std::ptr::null_mut());
            nativetrace_symbolizer(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_zero_capacity_writes_nothing() {
        let mut sentinel = [0xaau8; 1];
        let mut arg = TracebackArg { buf: sentinel.as_mut_ptr().cast(), max: 0, ..TracebackArg::default() };
        // SAFETY: max is zero so buf is never written
        unsafe { nativetrace_traceback(&mut arg) };
        assert_eq!(sentinel, [0xaa]);
    }
}
