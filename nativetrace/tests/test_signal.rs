//! Profiling-signal pressure on the unwinder
//!
//! A SIGPROF timer keeps interrupting a loop that is itself entering
//! contexts and unwinding. The handler unwinds from the interrupted state.
//! Set NATIVETRACE_STRESS_SECS for longer runs.

#![allow(unsafe_code)]

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nativetrace::callbacks::nativetrace_traceback;
use nativetrace::unwind;
use nativetrace_abi::TracebackArg;

static SIGNAL_TRACES: AtomicUsize = AtomicUsize::new(0);
static SIGNAL_FRAMES: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_sigprof(_sig: libc::c_int, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let mut buf = [0usize; 64];
    let mut arg = TracebackArg {
        sig_context: ucontext,
        buf: buf.as_mut_ptr(),
        max: buf.len(),
        ..TracebackArg::default()
    };
    // SAFETY: `ucontext` is this handler's own context and `buf` is local
    unsafe { nativetrace_traceback(&mut arg) };

    let n = buf.iter().position(|&pc| pc == 0).unwrap_or(buf.len());
    SIGNAL_TRACES.fetch_add(1, Ordering::Relaxed);
    SIGNAL_FRAMES.fetch_add(n, Ordering::Relaxed);
}

fn set_profiling_timer(interval: Duration) {
    let tv = libc::timeval {
        tv_sec: 0,
        tv_usec: libc::suseconds_t::try_from(interval.as_micros()).unwrap(),
    };
    let timer = libc::itimerval { it_interval: tv, it_value: tv };
    // SAFETY: plain syscall with a valid itimerval
    assert_eq!(unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) }, 0);
}

fn install_handler(handler: libc::sighandler_t, flags: libc::c_int) {
    // SAFETY: zeroed sigaction is valid, the handler is async-signal-safe
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = flags;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()), 0);
    }
}

#[test]
fn test_unwind_under_profiling_signal() {
    let secs = std::env::var("NATIVETRACE_STRESS_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);

    // Tables are compiled outside signal context
    nativetrace::init(nativetrace::Config { eager_tables: true, ..Default::default() });

    install_handler(on_sigprof as usize, libc::SA_SIGINFO | libc::SA_RESTART);
    set_profiling_timer(Duration::from_millis(1));

    let deadline = Instant::now() + Duration::from_secs(secs);
    let mut iterations = 0u64;
    while Instant::now() < deadline {
        common::native_outer(&mut || {
            let token = common::host_enter();
            let mut buf = [0usize; 64];
            let n = unwind::capture(&mut buf);
            common::host_leave(token);
            n
        });
        iterations += 1;
    }

    set_profiling_timer(Duration::ZERO);
    install_handler(libc::SIG_IGN, 0);

    let traces = SIGNAL_TRACES.load(Ordering::Relaxed);
    println!(
        "{iterations} iterations, {traces} signal traces, {} signal frames",
        SIGNAL_FRAMES.load(Ordering::Relaxed)
    );
    assert!(iterations > 0);
    assert!(traces > 0, "SIGPROF never fired");
    assert!(SIGNAL_FRAMES.load(Ordering::Relaxed) > 0);
    assert_eq!(nativetrace::context::held(), 0);
}
