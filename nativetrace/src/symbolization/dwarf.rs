//! Debug-info backend: DWARF line tables and inlining chains
//!
//! Each module's DWARF is parsed once through the [`ModuleCache`]. A module
//! without DWARF of its own is matched with a separate debug file found by
//! build ID or `.gnu_debuglink`. Addresses without debug information are
//! answered by the module's static symbol table, then by the fast backend.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use addr2line::Context;
use gimli::{EndianArcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

use super::demangle::demangle;
use super::dladdr::DladdrSymbolizer;
use super::memory_maps::{LoadedModule, ModuleSource};
use super::module_cache::{DebugInfoLoader, ModuleCache};
use super::symbolizer::{InlinedFrame, InlinedFrames, SourceLocation, Symbolizer};
use crate::domain::{Result, TraceError};

const DEBUG_ROOT: &str = "/usr/lib/debug";

/// Function symbol from a module's static symbol table (link-time address)
#[derive(Debug, Clone, PartialEq, Eq)]
struct SymbolEntry {
    address: u64,
    size: u64,
    name: String,
}

/// Parsed debug information of one module
pub struct DebugInfo {
    ctx: Mutex<Context<EndianArcSlice<RunTimeEndian>>>,
    symbols: Vec<SymbolEntry>,
    has_dwarf: bool,
}

impl DebugInfo {
    /// Logical frames at a link-time address, innermost first
    fn frames(&self, svma: u64) -> std::result::Result<InlinedFrames, gimli::Error> {
        let mut frames = InlinedFrames::new();
        if !self.has_dwarf {
            return Ok(frames);
        }

        let ctx = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut iter = ctx.find_frames(svma).skip_all_loads()?;
        while let Some(frame) = iter.next()? {
            let function = frame
                .function
                .as_ref()
                .and_then(|f| f.raw_name().ok())
                .map(|name| demangle(&name));

            let location = frame.location.map(|loc| SourceLocation {
                file: loc.file.map(std::string::ToString::to_string),
                line: loc.line,
                column: loc.column,
            });

            frames.push(InlinedFrame { function, location, entry: 0, module: None });
        }
        Ok(frames)
    }

    /// Function symbol containing a link-time address
    fn symbol(&self, svma: u64) -> Option<&SymbolEntry> {
        let idx = self.symbols.partition_point(|s| s.address <= svma).checked_sub(1)?;
        let symbol = &self.symbols[idx];
        (symbol.size == 0 || svma < symbol.address + symbol.size).then_some(symbol)
    }

    #[must_use]
    pub fn has_dwarf(&self) -> bool {
        self.has_dwarf
    }
}

/// Reads a module's DWARF and symbol table from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct DwarfLoader;

impl DebugInfoLoader for DwarfLoader {
    type Handle = DebugInfo;

    fn load(&self, module: &LoadedModule) -> Result<DebugInfo> {
        let path = module.path();
        if module.in_memory {
            return Err(TraceError::NoDebugInfo(path.display().to_string()));
        }

        let data = fs::read(path)?;
        module.check_file(&data)?;
        let obj = parse(&data, path)?;
        let symbols = collect_symbols(&obj);

        let (ctx, has_dwarf) = if has_debug_info(&obj) {
            (load_context(&obj, path)?, true)
        } else if let Some(debug_path) = separate_debug_file(&obj, path) {
            debug!("Using {} for {}", debug_path.display(), path.display());
            let debug_data = fs::read(&debug_path)?;
            let debug_obj = parse(&debug_data, &debug_path)?;
            (load_context(&debug_obj, &debug_path)?, has_debug_info(&debug_obj))
        } else {
            (load_context(&obj, path)?, false)
        };

        if !has_dwarf && symbols.is_empty() {
            return Err(TraceError::NoDebugInfo(path.display().to_string()));
        }
        Ok(DebugInfo { ctx: Mutex::new(ctx), symbols, has_dwarf })
    }
}

fn parse<'data>(data: &'data [u8], path: &Path) -> Result<object::File<'data>> {
    object::File::parse(data).map_err(|e| TraceError::ObjectParse {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}

fn has_debug_info(obj: &object::File<'_>) -> bool {
    obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0)
}

fn load_context(
    obj: &object::File<'_>,
    path: &Path,
) -> Result<Context<EndianArcSlice<RunTimeEndian>>> {
    let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section =
        |id: gimli::SectionId| -> std::result::Result<EndianArcSlice<RunTimeEndian>, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok(EndianArcSlice::new(Arc::from(&*data), endian))
        };

    let dwarf_error =
        |e: gimli::Error| TraceError::Dwarf { path: path.display().to_string(), error: e.to_string() };
    let dwarf = gimli::Dwarf::load(&load_section).map_err(dwarf_error)?;
    Context::from_dwarf(dwarf).map_err(dwarf_error)
}

fn collect_symbols(obj: &object::File<'_>) -> Vec<SymbolEntry> {
    let mut symbols: Vec<SymbolEntry> = obj
        .symbols()
        .filter(|s| s.kind() == SymbolKind::Text && s.is_definition() && s.address() != 0)
        .filter_map(|s| {
            let name = s.name().ok()?;
            Some(SymbolEntry { address: s.address(), size: s.size(), name: demangle(name) })
        })
        .collect();
    symbols.sort_by_key(|s| s.address);
    symbols.dedup_by_key(|s| s.address);
    symbols
}

/// Finds a separate debug file by build ID, then by `.gnu_debuglink`
fn separate_debug_file(obj: &object::File<'_>, path: &Path) -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(Some(id)) = obj.build_id() {
        if id.len() > 1 {
            let hex: String = id.iter().map(|b| format!("{b:02x}")).collect();
            candidates.push(
                Path::new(DEBUG_ROOT)
                    .join(".build-id")
                    .join(&hex[..2])
                    .join(format!("{}.debug", &hex[2..])),
            );
        }
    }

    if let Ok(Some((name, _crc))) = obj.gnu_debuglink() {
        let name = String::from_utf8_lossy(name).into_owned();
        if let Some(dir) = path.parent() {
            candidates.push(dir.join(&name));
            candidates.push(dir.join(".debug").join(&name));
            let relative = dir.strip_prefix("/").unwrap_or(dir);
            candidates.push(Path::new(DEBUG_ROOT).join(relative).join(&name));
        }
    }

    candidates.into_iter().find(|c| c.as_path() != path && c.is_file())
}

/// DWARF symbolizer with the fast backend as fallback
pub struct DwarfSymbolizer {
    cache: ModuleCache<DwarfLoader>,
    fallback: DladdrSymbolizer,
}

impl Default for DwarfSymbolizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DwarfSymbolizer {
    /// Symbolizer over the modules of this process
    #[must_use]
    pub fn new() -> Self {
        Self { cache: ModuleCache::new(DwarfLoader), fallback: DladdrSymbolizer }
    }

    #[must_use]
    pub fn with_source(source: Box<dyn ModuleSource>) -> Self {
        Self { cache: ModuleCache::with_source(DwarfLoader, source), fallback: DladdrSymbolizer }
    }

    #[must_use]
    pub fn cache(&self) -> &ModuleCache<DwarfLoader> {
        &self.cache
    }
}

impl Symbolizer for DwarfSymbolizer {
    fn name(&self) -> &'static str {
        "debuginfo"
    }

    fn has_line_info(&self, module: &LoadedModule) -> Option<bool> {
        Some(self.cache.lookup_or_load(module).is_some_and(|info| info.has_dwarf()))
    }

    fn addr_to_symbols(&self, addr: u64) -> Result<InlinedFrames> {
        let Some((module, Some(info))) = self.cache.resolve(addr) else {
            return self.fallback.addr_to_symbols(addr);
        };
        let svma = addr.wrapping_sub(module.id.bias);

        let mut frames = match info.frames(svma) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("DWARF lookup of {addr:#x} in {} failed: {e}", module.id);
                InlinedFrames::new()
            }
        };
        let symbol = info.symbol(svma);

        if frames.is_empty() {
            match symbol {
                Some(symbol) => frames.push(InlinedFrame {
                    function: Some(symbol.name.clone()),
                    ..InlinedFrame::default()
                }),
                None => return self.fallback.addr_to_symbols(addr),
            }
        }

        // The outermost frame is the physical function
        if let Some(outer) = frames.last_mut() {
            if outer.function.is_none() {
                outer.function = match symbol {
                    Some(symbol) => Some(symbol.name.clone()),
                    None => self
                        .fallback
                        .addr_to_symbols(addr)
                        .ok()
                        .and_then(|f| f.into_iter().next())
                        .and_then(|f| f.function),
                };
            }
        }

        let entry = symbol.map_or(0, |s| s.address.wrapping_add(module.id.bias));
        for frame in &mut frames {
            frame.entry = entry;
            frame.module = Some(Arc::clone(&module.id.path));
        }
        Ok(frames)
    }

    fn refresh(&self) {
        self.cache.prune();
    }
}
