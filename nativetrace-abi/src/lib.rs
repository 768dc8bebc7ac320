//! # Host Runtime Callback Interface
//!
//! Defines the argument blocks exchanged between a managed-language runtime's
//! native-traceback mechanism and the `nativetrace` engine. All types use
//! `#[repr(C)]` with word-sized fields so the host can hand out pointers to
//! its own structs and the engine reads and writes them in place.
//!
//! ## Protocol
//!
//! Three callbacks are registered once at process start:
//!
//! 1. **context** - called with [`ContextArg`] around every managed-to-native
//!    call. A zero `context` asks for a new token, a non-zero one releases it.
//! 2. **traceback** - called with [`TracebackArg`] whenever the host needs the
//!    native part of a stack. Fills `buf` with up to `max` addresses, ending
//!    with [`END_OF_STACK`] when there is room left.
//! 3. **symbolizer** - called with [`SymbolizerArg`] once per recorded
//!    address, repeatedly while `more` is set, and finally with
//!    `pc == `[`DONE_PC`] so any per-address state can be released.
//!
//! Layout changes are versioned through [`INTERFACE_VERSION`].

#![no_std]

use core::ffi::{c_char, c_void};

// ============================================================================
// Constants
// ============================================================================

/// Version of the callback contract implemented by these structs
///
/// Passed to the host's registration routine alongside the three callbacks.
pub const INTERFACE_VERSION: usize = 0;

/// Address written after the last recorded frame when `buf` has spare room
pub const END_OF_STACK: usize = 0;

/// `pc` value of the final symbolizer call for an address
///
/// Tells the symbolizer no further answers are needed and any state kept in
/// [`SymbolizerArg::data`] can be dropped.
pub const DONE_PC: usize = 0;

/// Null context token
pub const NO_CONTEXT: usize = 0;

// ============================================================================
// Callback Arguments
// ============================================================================

/// Argument of the context callback
///
/// The host reads `context` back after the call returns and hands the same
/// value to the traceback callback for stacks crossing this native call.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextArg {
    /// Context token
    ///
    /// - In: [`NO_CONTEXT`] when native code is being entered, otherwise the
    ///   token being released
    /// - Out: the new token (or [`NO_CONTEXT`] when none could be allocated)
    pub context: usize,
}

/// Argument of the traceback callback
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TracebackArg {
    /// Token from a previous context call, or [`NO_CONTEXT`]
    ///
    /// Non-zero when the host is unwinding an earlier native portion of a
    /// mixed stack; zero when the leaf of the stack is native code.
    pub context: usize,

    /// Interrupted register state (`ucontext_t *`) when called from a signal
    /// handler, otherwise null
    pub sig_context: *mut c_void,

    /// Output array of instruction addresses, owned by the host
    pub buf: *mut usize,

    /// Capacity of `buf` in entries
    pub max: usize,
}

impl Default for TracebackArg {
    fn default() -> Self {
        Self {
            context: NO_CONTEXT,
            sig_context: core::ptr::null_mut(),
            buf: core::ptr::null_mut(),
            max: 0,
        }
    }
}

/// Argument of the symbolizer callback
///
/// String outputs point at NUL-terminated strings that stay valid for the
/// rest of the process lifetime.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SymbolizerArg {
    /// Address to symbolize, or [`DONE_PC`] on the final call
    pub pc: usize,

    /// Out: source file (or containing module path), null when unknown
    pub file: *const c_char,

    /// Out: source line, 0 when unknown
    pub lineno: usize,

    /// Out: function name, null when unknown
    pub func: *const c_char,

    /// Out: entry address of the containing function, 0 when unknown
    pub entry: usize,

    /// Out: non-zero if another call with the same `pc` yields an outer
    /// (inlining caller) frame
    pub more: usize,

    /// Opaque state preserved by the host between calls for the same `pc`
    pub data: usize,
}

impl Default for SymbolizerArg {
    fn default() -> Self {
        Self {
            pc: DONE_PC,
            file: core::ptr::null(),
            lineno: 0,
            func: core::ptr::null(),
            entry: 0,
            more: 0,
            data: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_layouts_are_word_sized() {
        let word = size_of::<usize>();
        assert_eq!(size_of::<ContextArg>(), word);
        assert_eq!(size_of::<TracebackArg>(), 4 * word);
        assert_eq!(size_of::<SymbolizerArg>(), 7 * word);
    }

    #[test]
    fn test_defaults_are_empty() {
        let arg = SymbolizerArg::default();
        assert_eq!(arg.pc, DONE_PC);
        assert!(arg.func.is_null());
        assert_eq!(arg.more, 0);

        let tb = TracebackArg::default();
        assert_eq!(tb.context, NO_CONTEXT);
        assert!(tb.buf.is_null());
    }
}
