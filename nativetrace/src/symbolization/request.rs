//! Per-address symbolization protocol
//!
//! The host asks about one address at a time and keeps asking while the
//! answer says more frames follow. The frames not yet handed out travel
//! with the request between calls.

use log::debug;

use super::symbolizer::{InlinedFrame, InlinedFrames, Symbolizer};
use crate::gate;
use crate::stats::{self, Counter};

/// Address marking the final call for an address
pub const DONE: u64 = 0;

/// Frames of one address still to be handed out
#[derive(Debug)]
pub struct PendingFrames {
    pc: u64,
    frames: InlinedFrames,
    next: usize,
}

impl PendingFrames {
    fn pop(&mut self) -> Option<InlinedFrame> {
        let frame = self.frames.get_mut(self.next).map(std::mem::take);
        self.next += 1;
        frame
    }

    fn remaining(&self) -> usize {
        self.frames.len().saturating_sub(self.next)
    }
}

/// One call of the symbolization protocol
#[derive(Debug, Default)]
pub struct SymbolRequest {
    /// Address to describe, or [`DONE`]
    pub pc: u64,
    pub function: Option<String>,
    pub file: Option<String>,
    /// 0 when unknown
    pub line: u32,
    /// Entry address of the containing function, 0 when unknown
    pub entry: u64,
    /// Another call with the same `pc` yields the next outer frame
    pub more: bool,
    pending: Option<Box<PendingFrames>>,
}

impl SymbolRequest {
    #[must_use]
    pub fn new(pc: u64) -> Self {
        Self { pc, ..Self::default() }
    }

    /// Moves to the next address, keeping the carried state so a repeated
    /// `pc` continues where it left off
    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// State carried to the next call, if any
    pub(crate) fn take_pending(&mut self) -> Option<Box<PendingFrames>> {
        self.pending.take()
    }

    pub(crate) fn set_pending(&mut self, pending: Option<Box<PendingFrames>>) {
        self.pending = pending;
    }

    fn clear_answer(&mut self) {
        self.function = None;
        self.file = None;
        self.line = 0;
        self.entry = 0;
        self.more = false;
    }

    fn fill(&mut self, frame: InlinedFrame) {
        self.file = frame.file();
        self.line = frame.line();
        self.entry = frame.entry;
        self.function = frame.function;
    }
}

/// Answers [`SymbolRequest`]s with one symbolizer backend
pub struct Resolver {
    symbolizer: Box<dyn Symbolizer>,
}

impl Resolver {
    #[must_use]
    pub fn new(symbolizer: Box<dyn Symbolizer>) -> Self {
        Self { symbolizer }
    }

    #[must_use]
    pub fn symbolizer(&self) -> &dyn Symbolizer {
        self.symbolizer.as_ref()
    }

    /// Writes the next frame for `req.pc` into `req`
    ///
    /// The first call for an address emits the innermost inlined frame and
    /// each repeat emits the next one outwards, with `more` set until the
    /// physical frame is reached. A [`DONE`] call releases the carried
    /// state. Unknown addresses get an empty answer.
    pub fn symbolize(&self, req: &mut SymbolRequest) {
        req.clear_answer();
        let carried = req.take_pending();

        if req.pc == DONE || !gate::is_enabled() {
            return;
        }

        let mut pending = match carried {
            Some(pending) if pending.pc == req.pc && pending.remaining() > 0 => pending,
            _ => {
                stats::incr(Counter::SymbolRequests);
                let frames = self.symbolizer.addr_to_symbols(req.pc).unwrap_or_else(|e| {
                    debug!("{} backend: {e}", self.symbolizer.name());
                    InlinedFrames::new()
                });
                Box::new(PendingFrames { pc: req.pc, frames, next: 0 })
            }
        };

        if let Some(frame) = pending.pop() {
            req.fill(frame);
        }
        req.more = pending.remaining() > 0;
        if req.more {
            req.set_pending(Some(pending));
        }
    }
}
