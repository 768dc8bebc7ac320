//! Process-wide enable switch
//!
//! Read on every hot-path call, including from signal handlers, so it is a
//! single relaxed atomic. Toggling only affects calls that start afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Returns true if tracing is currently enabled
#[inline]
#[must_use]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Enables or disables the context tracker, the unwinder and the resolver
#[inline]
pub(crate) fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}
