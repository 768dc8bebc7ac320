//! # Symbol Resolution
//!
//! Converts instruction addresses recorded by the unwinder into function
//! names and, when debug information is available, source files, lines and
//! inlined call chains. This process is called **symbolization**.
//!
//! ## Backends
//!
//! Two interchangeable [`Symbolizer`] strategies, chosen once when the
//! tracer is initialized:
//!
//! - **Fast** ([`DladdrSymbolizer`]): asks the dynamic loader for the
//!   nearest exported symbol. Function name, module path and entry address;
//!   never a line number, never more than one frame.
//! - **Debug info** ([`DwarfSymbolizer`], cargo feature `debuginfo`): parses
//!   each module's DWARF once via the [`ModuleCache`] and maps the address to
//!   a line entry plus the chain of inlined calls at that address.
//!
//! ```text
//! addr ──▶ ModuleSource::locate ──▶ LoadedModule { path, bias }
//!                                        │
//!             ModuleCache::lookup_or_load (parse once per ModuleId)
//!                                        │
//!     svma = addr - bias ──▶ addr2line find_frames ──▶ [inner, ..., outer]
//!                                        │ no DWARF
//!                                        ▼
//!                         .symtab ──▶ dladdr (fast backend)
//! ```
//!
//! ## Address Translation
//!
//! DWARF and symbol tables use link-time addresses (svma). A module loaded
//! with bias `b` has `runtime = svma + b`, where the bias comes straight
//! from the dynamic loader, so PIE executables, shared objects and non-PIE
//! executables are handled alike.
//!
//! ## Inlined Frames
//!
//! One physical address may stand for several logical calls. They are
//! reported innermost first; [`Resolver::symbolize`] hands them out one per
//! call with `more` set until the physical frame is reached.
//!
//! ## Unloading
//!
//! Cache entries are keyed by load bias and path. When a lookup finds a
//! different module mapped over a cached one, the stale entry is evicted;
//! [`ModuleCache::prune`] drops entries of every module no longer loaded.

pub mod demangle;
pub mod dladdr;
#[cfg(feature = "debuginfo")]
pub mod dwarf;
pub mod memory_maps;
pub mod module_cache;
pub mod request;
pub mod symbolizer;

pub use dladdr::DladdrSymbolizer;
#[cfg(feature = "debuginfo")]
pub use dwarf::DwarfSymbolizer;
pub use memory_maps::{loaded_modules, LoadedModule, MemoryRange, ModuleId, ModuleSource, ProcessModules};
pub use module_cache::{DebugInfoLoader, ModuleCache, ModuleCacheEntry};
pub use request::{Resolver, SymbolRequest};
pub use symbolizer::{InlinedFrame, InlinedFrames, ResolvedFrame, SourceLocation, Symbolizer};
