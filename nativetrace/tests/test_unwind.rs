mod common;

use nativetrace::unwind::registers::Registers;
use nativetrace::unwind::{self, Cursor, UnwindRequest, MIN_VALID_PC};

#[test]
fn test_unwind_is_deterministic() {
    let mut traces = Vec::new();
    for _ in 0..2 {
        let mut buf = [0usize; 128];
        let n = common::native_outer(&mut || unwind::capture(&mut buf));
        traces.push(buf[..n].to_vec());
    }

    println!("captured {} frames", traces[0].len());
    assert!(traces[0].len() >= 3, "expected at least the fixture frames");
    assert_eq!(traces[0], traces[1]);
}

#[test]
fn test_output_is_bounded_by_capacity() {
    const SENTINEL: usize = 0xdead_beef;

    for capacity in 0..40 {
        let mut storage = [SENTINEL; 48];
        let count = common::native_outer(&mut || {
            let mut req = UnwindRequest::new(&mut storage[..capacity]);
            unwind::unwind(&mut req);
            assert!(req.count() <= req.capacity());
            req.count()
        });

        assert!(count <= capacity, "capacity {capacity} produced {count} frames");
        assert!(storage[capacity..].iter().all(|&w| w == SENTINEL));
    }
}

#[test]
fn test_zero_capacity_is_trivial() {
    let mut req = UnwindRequest::new(&mut []);
    unwind::unwind(&mut req);
    assert_eq!(req.count(), 0);
    assert!(req.frames().is_empty());
    assert_eq!(unwind::capture(&mut []), 0);
}

#[test]
fn test_small_buffer_holds_innermost_frames() {
    let mut full = [0usize; 64];
    let mut short = [0usize; 2];
    common::native_outer(&mut || {
        let n = unwind::capture(&mut full);
        let m = unwind::capture(&mut short);
        n + m
    });

    // Different call sites inside the closure, same callers above it
    assert_eq!(full[1], short[1]);
}

#[test]
fn test_cursor_walks_plausible_frames() {
    unwind::tables::refresh();
    let Some(regs) = Registers::current() else {
        println!("register capture unsupported on this target");
        return;
    };

    let frames: Vec<_> = Cursor::new(regs, false).take(64).collect();
    assert!(frames.len() >= 2, "walked only {} frames", frames.len());
    for frame in &frames {
        assert!(frame.ip >= MIN_VALID_PC);
    }
    for pair in frames.windows(2) {
        assert!(pair[1].sp >= pair[0].sp, "stack must grow toward callers");
    }
}

#[test]
fn test_refresh_reports_only_new_tables() {
    nativetrace::refresh_modules();
    assert_eq!(nativetrace::refresh_modules(), 0);
}
