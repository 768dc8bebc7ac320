//! # nativetrace - Native Stack Traces for Managed Runtimes
//!
//! nativetrace plugs into the native-traceback hooks of a managed-language
//! runtime (the shape popularized by cgo's `SetCgoTraceback`) so profiles,
//! panics and crash reports show the native frames below a foreign call
//! instead of stopping at the language boundary.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Host Runtime (managed)                      │
//! │     managed → native call     signal / traceback     report     │
//! └──────┬──────────────────────────────┬───────────────────┬───────┘
//!        │ context(0 / token)           │ traceback          │ symbolizer
//!        ▼                              ▼                    ▼
//! ┌──────────────┐             ┌────────────────┐   ┌────────────────┐
//! │   Context    │  boundary   │     Stack      │   │    Resolver    │
//! │   Tracker    │────stack───▶│    Unwinder    │   │  (one backend) │
//! └──────────────┘             └───────┬────────┘   └───────┬────────┘
//!                                      │ lock-free           │
//!                                      ▼                     ▼
//!                              ┌────────────────┐   ┌────────────────┐
//!                              │ Unwind Tables  │   │  Module Cache  │
//!                              │  (.eh_frame)   │   │ (DWARF, once)  │
//!                              └────────────────┘   └────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`callbacks`]: `extern "C"` entry points registered with the host
//! - [`context`]: context tokens and the boundary stacks cached with them
//! - [`unwind`]: async-signal-safe stack walking over compiled CFI tables
//! - [`symbolization`]: address → function/file/line, fast or debug-info
//! - [`config`]: `NATIVETRACE_*` environment configuration
//! - [`stats`]: process-wide counters
//! - [`cli`]: arguments of the `nativetrace` diagnostic binary
//! - [`domain`]: shared types and errors
//!
//! ## Signal Safety
//!
//! The traceback path never allocates, locks or logs. Unwind tables are
//! compiled outside signal context and published through an append-only
//! array of atomic pointers; the walker only reads them.
//!
//! ## Typical Usage
//!
//! ```no_run
//! let mut buf = [0usize; 64];
//! let n = nativetrace::unwind::capture(&mut buf);
//! for (i, &pc) in buf[..n].iter().enumerate() {
//!     println!("{}", nativetrace::tracer().resolve(pc as u64).format(i));
//! }
//! ```

pub mod callbacks;
pub mod cli;
pub mod config;
pub mod context;
pub mod domain;
mod gate;
pub mod stats;
pub mod symbolization;
pub mod unwind;

use std::sync::OnceLock;

use log::{debug, info, warn};

pub use config::Config;
pub use domain::{Backend, CallContext, Result, TraceError};

use symbolization::{DladdrSymbolizer, ResolvedFrame, Resolver, SymbolRequest, Symbolizer};

static TRACER: OnceLock<Tracer> = OnceLock::new();

/// Process-wide engine state built from a [`Config`]
pub struct Tracer {
    config: Config,
    resolver: Resolver,
}

impl Tracer {
    fn new(config: Config) -> Self {
        gate::set_enabled(config.enabled);
        context::set_skip(config.context_skip);

        if config.eager_tables {
            unwind::tables::ensure_current();
        }

        let symbolizer = make_symbolizer(config.backend);
        info!(
            "nativetrace ready: backend={}, enabled={}, context_skip={}",
            symbolizer.name(),
            config.enabled,
            config.context_skip
        );

        Self { config, resolver: Resolver::new(symbolizer) }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Backend actually in use (may differ from the configured one when the
    /// `debuginfo` feature is off)
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.resolver.symbolizer().name()
    }

    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// One step of the symbolizer protocol, see [`Resolver::symbolize`]
    pub fn symbolize(&self, req: &mut SymbolRequest) {
        self.resolver.symbolize(req);
    }

    /// All logical frames of `addr` at once
    #[must_use]
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        self.resolver.symbolizer().resolve(addr)
    }

    /// Picks up modules loaded or unloaded since the last call
    ///
    /// Returns the number of unwind tables this call compiled.
    pub fn refresh_modules(&self) -> usize {
        let added = unwind::tables::refresh();
        self.resolver.symbolizer().refresh();
        added
    }
}

fn make_symbolizer(backend: Backend) -> Box<dyn Symbolizer> {
    match backend {
        Backend::Fast => Box::new(DladdrSymbolizer::new()),
        #[cfg(feature = "debuginfo")]
        Backend::DebugInfo => Box::new(symbolization::DwarfSymbolizer::new()),
        #[cfg(not(feature = "debuginfo"))]
        Backend::DebugInfo => {
            warn!("built without the debuginfo feature, using the fast symbolizer");
            Box::new(DladdrSymbolizer::new())
        }
    }
}

/// Initializes the engine with an explicit configuration
///
/// The first call wins; later calls return the existing tracer unchanged.
pub fn init(config: Config) -> &'static Tracer {
    let mut fresh = false;
    let tracer = TRACER.get_or_init(|| {
        fresh = true;
        Tracer::new(config.clone())
    });
    if !fresh && tracer.config != config {
        debug!("nativetrace already initialized, ignoring {config:?}");
    }
    tracer
}

/// The engine, initialized from the environment on first use
pub fn tracer() -> &'static Tracer {
    TRACER.get_or_init(|| {
        let config = Config::from_env().unwrap_or_else(|e| {
            warn!("{e}, using defaults");
            Config::default()
        });
        Tracer::new(config)
    })
}

/// See [`Tracer::refresh_modules`]
pub fn refresh_modules() -> usize {
    tracer().refresh_modules()
}

#[doc(hidden)]
pub mod testing {
    //! Hooks for integration tests

    pub use crate::gate::is_enabled;

    pub fn set_enabled(enabled: bool) {
        crate::gate::set_enabled(enabled);
    }
}
