//! Runs alone in its own binary: the gate is process-wide

mod common;

use nativetrace::symbolization::SymbolRequest;
use nativetrace::unwind::{self, UnwindRequest};
use nativetrace::{context, testing, CallContext, Config};

#[test]
fn test_disable_is_idempotent() {
    let tracer = nativetrace::init(Config::default());
    assert!(testing::is_enabled());

    for round in 0..50 {
        let on = round % 3 != 0;
        testing::set_enabled(on);
        testing::set_enabled(on);

        let mut buf = [0usize; 32];
        let n = common::native_outer(&mut || {
            let mut req = UnwindRequest::new(&mut buf);
            unwind::unwind(&mut req);
            req.count()
        });
        let token = context::enter(CallContext::NULL);
        let mut req = SymbolRequest::new(common::native_inner as usize as u64);
        tracer.symbolize(&mut req);

        if on {
            assert!(n > 0);
            assert!(!token.is_null());
        } else {
            assert_eq!(n, 0);
            assert!(token.is_null());
            assert!(req.function.is_none() && req.file.is_none() && req.line == 0);
            assert_eq!(unwind::capture(&mut buf), 0);
        }
        context::leave(token);
    }

    testing::set_enabled(true);
    assert_eq!(context::held(), 0);
}
