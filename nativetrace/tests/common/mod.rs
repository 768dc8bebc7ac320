//! Native call-chain fixtures shared by the integration tests
//!
//! The callback is passed down explicitly so every test owns what runs at
//! the bottom of the chain.

#![allow(dead_code, unsafe_code)]

use std::hint::black_box;

use nativetrace::callbacks::nativetrace_context;
use nativetrace_abi::ContextArg;

/// Outer native function of the two-level fixture chain
#[inline(never)]
pub fn native_outer(callback: &mut dyn FnMut() -> usize) -> usize {
    black_box(native_inner(callback))
}

/// Inner native function; runs `callback` with both fixtures on the stack
#[inline(never)]
pub fn native_inner(callback: &mut dyn FnMut() -> usize) -> usize {
    let n = callback();
    black_box(n)
}

/// Stands in for the host runtime frame that calls the context callback
/// before jumping into native code
#[inline(never)]
pub fn host_enter() -> usize {
    let mut arg = ContextArg::default();
    // SAFETY: `arg` is a valid ContextArg
    unsafe { nativetrace_context(&mut arg) };
    black_box(arg.context)
}

#[inline(never)]
pub fn host_leave(token: usize) {
    let mut arg = ContextArg { context: token };
    // SAFETY: as above
    unsafe { nativetrace_context(&mut arg) };
}

/// Names of the fixture functions as the symbolizer reports them
pub fn fixture_positions(names: &[String]) -> (Option<usize>, Option<usize>) {
    let inner = names.iter().position(|n| n.ends_with("native_inner"));
    let outer = names.iter().position(|n| n.ends_with("native_outer"));
    (inner, outer)
}
