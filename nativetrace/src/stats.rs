//! Diagnostic counters
//!
//! Plain relaxed atomics: they are bumped from the signal path, so no
//! locking and no allocation. Totals are process-wide and never reset.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Traces,
    SignalTraces,
    TruncatedTraces,
    ContextTraces,
    ContextsCreated,
    PoolExhausted,
    MismatchedLeaves,
    SymbolRequests,
    CacheHits,
    CacheLoads,
    CacheEvictions,
}

const COUNTERS: usize = 11;

static VALUES: [AtomicU64; COUNTERS] = [const { AtomicU64::new(0) }; COUNTERS];

#[inline]
pub(crate) fn incr(counter: Counter) {
    VALUES[counter as usize].fetch_add(1, Ordering::Relaxed);
}

fn get(counter: Counter) -> u64 {
    VALUES[counter as usize].load(Ordering::Relaxed)
}

/// Point-in-time copy of the diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Unwinds that produced a stack (any source)
    pub traces: u64,
    /// Unwinds started from an interrupted signal context
    pub signal_traces: u64,
    /// Unwinds that filled the buffer before reaching the end of the stack
    pub truncated_traces: u64,
    /// Unwinds answered from a context token's cached boundary stack
    pub context_traces: u64,
    pub contexts_created: u64,
    /// Context requests refused because the thread's slot pool was full
    pub pool_exhausted: u64,
    /// Releases of tokens that were not held
    pub mismatched_leaves: u64,
    pub symbol_requests: u64,
    pub cache_hits: u64,
    pub cache_loads: u64,
    pub cache_evictions: u64,
}

/// Returns the current counter values
#[must_use]
pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        traces: get(Counter::Traces),
        signal_traces: get(Counter::SignalTraces),
        truncated_traces: get(Counter::TruncatedTraces),
        context_traces: get(Counter::ContextTraces),
        contexts_created: get(Counter::ContextsCreated),
        pool_exhausted: get(Counter::PoolExhausted),
        mismatched_leaves: get(Counter::MismatchedLeaves),
        symbol_requests: get(Counter::SymbolRequests),
        cache_hits: get(Counter::CacheHits),
        cache_loads: get(Counter::CacheLoads),
        cache_evictions: get(Counter::CacheEvictions),
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "traces:            {}", self.traces)?;
        writeln!(f, "  from signal:     {}", self.signal_traces)?;
        writeln!(f, "  from context:    {}", self.context_traces)?;
        writeln!(f, "  truncated:       {}", self.truncated_traces)?;
        writeln!(f, "contexts created:  {}", self.contexts_created)?;
        writeln!(f, "  pool exhausted:  {}", self.pool_exhausted)?;
        writeln!(f, "  bad releases:    {}", self.mismatched_leaves)?;
        writeln!(f, "symbol requests:   {}", self.symbol_requests)?;
        writeln!(f, "module cache:      {} hits, {} loads, {} evictions",
            self.cache_hits, self.cache_loads, self.cache_evictions)
    }
}
