//! Precompiled frame description tables
//!
//! Each loaded module's `.eh_frame` is compiled, outside signal context,
//! into a sorted array of compact [`FrameDesc`] rows: how to find the
//! canonical frame address (CFA) and where the caller's frame pointer and
//! return address were saved. Tables are published append-only through
//! atomics and never freed, so the signal path only does atomic loads and
//! binary searches. Tables of unloaded modules are retired, not removed.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, EhFrame, NativeEndian, Register, RegisterRule,
    UnwindContext, UnwindSection,
};
use log::{debug, info, warn};
use object::{Object, ObjectSection};

use crate::domain::{Result, TraceError};
use crate::symbolization::memory_maps::{
    loaded_modules, loader_generation, LoadedModule, MemoryRange, ModuleId,
};

/// DWARF register numbers
#[cfg(target_arch = "aarch64")]
mod reg {
    use gimli::Register;
    pub const FP: Register = Register(29);
    pub const RA: Register = Register(30);
    pub const SP: Register = Register(31);
}

#[cfg(not(target_arch = "aarch64"))]
mod reg {
    use gimli::Register;
    pub const FP: Register = Register(6);
    pub const SP: Register = Register(7);
    pub const RA: Register = Register(16);
}

/// Upper bound on published tables, including retired ones
pub const MAX_TABLES: usize = 1024;

/// How the canonical frame address is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cfa {
    /// `sp + offset`
    Sp(i32),
    /// `fp + offset`
    Fp(i32),
    /// PLT stub: `sp + offset`, plus one word once the stub has pushed
    Plt(i32),
    /// Covered by CFI we cannot evaluate
    Unsupported,
}

/// Where a register of the caller lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Saved {
    /// Not modified by this frame (for the return address: still in `lr`)
    Unchanged,
    /// Stored at `cfa + offset`
    At(i32),
    /// Recoverable only through a rule we do not evaluate
    Lost,
}

/// Unwind rule valid from `pc` up to the next row's `pc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameDesc {
    /// Link-time address
    pub pc: u64,
    pub cfa: Cfa,
    pub fp: Saved,
    pub ra: Saved,
}

impl FrameDesc {
    /// Frame-pointer chain rule used where no CFI applies: the frame record
    /// `{saved fp, return address}` sits at `fp`.
    pub(crate) const FRAME_POINTER: FrameDesc =
        FrameDesc { pc: 0, cfa: Cfa::Fp(16), fp: Saved::At(-16), ra: Saved::At(-8) };

    fn same_rule(&self, other: &FrameDesc) -> bool {
        self.cfa == other.cfa && self.fp == other.fp && self.ra == other.ra
    }
}

/// Compiled table of one module
pub(crate) struct ModuleTable {
    id: ModuleId,
    text: MemoryRange,
    entries: Box<[FrameDesc]>,
    retired: AtomicBool,
}

impl ModuleTable {
    fn find(&self, addr: u64) -> Option<FrameDesc> {
        let svma = addr.wrapping_sub(self.id.bias);
        let idx = self.entries.partition_point(|e| e.pc <= svma);
        idx.checked_sub(1).map(|i| self.entries[i])
    }
}

static TABLES: [AtomicPtr<ModuleTable>; MAX_TABLES] =
    [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_TABLES];
static PUBLISHED: AtomicUsize = AtomicUsize::new(0);

/// Modules whose compilation failed, so refreshes do not retry them
static FAILED: Mutex<Option<HashMap<ModuleId, String>>> = Mutex::new(None);

/// Loader generation the published tables were built against
static BUILT_FOR: AtomicU64 = AtomicU64::new(u64::MAX);

#[allow(unsafe_code)]
fn published() -> impl DoubleEndedIterator<Item = &'static ModuleTable> {
    let count = PUBLISHED.load(Ordering::Acquire).min(MAX_TABLES);
    TABLES[..count].iter().filter_map(|slot| {
        let ptr = slot.load(Ordering::Acquire);
        // SAFETY: published tables are leaked and never freed or mutated
        // except through their atomic `retired` flag.
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    })
}

/// Finds the unwind rule for `pc`
///
/// Async-signal-safe. `None` means no table covers `pc`; the caller falls
/// back to [`FrameDesc::FRAME_POINTER`].
pub(crate) fn lookup(pc: usize) -> Option<FrameDesc> {
    let addr = pc as u64;
    // Newest first, so a module mapped over a retired one wins
    published()
        .rev()
        .find(|t| !t.retired.load(Ordering::Relaxed) && t.text.contains(addr))
        .and_then(|t| t.find(addr))
}

/// Refreshes the tables if modules were loaded or unloaded since they were
/// last built. Not signal-safe.
pub(crate) fn ensure_current() {
    if BUILT_FOR.load(Ordering::Acquire) == loader_generation() {
        return;
    }
    let added = refresh();
    if added > 0 {
        info!("Compiled unwind tables for {added} modules");
    }
}

/// Brings the published tables in line with the currently loaded modules
///
/// Compiles a table for every module that does not have one yet and retires
/// the tables of modules that are gone. Returns the number of new tables.
/// Must not be called from a signal handler.
pub fn refresh() -> usize {
    let mut guard = FAILED.lock().unwrap_or_else(PoisonError::into_inner);
    let failed = guard.get_or_insert_with(HashMap::new);
    // Read before listing, so a module loaded meanwhile triggers another pass
    let generation = loader_generation();
    let loaded = loaded_modules();

    for table in published() {
        if !table.retired.load(Ordering::Relaxed) && !loaded.iter().any(|m| m.id == table.id) {
            debug!("Retiring unwind table for {}", table.id);
            table.retired.store(true, Ordering::Relaxed);
        }
    }
    failed.retain(|id, _| loaded.iter().any(|m| &m.id == id));

    let mut added = 0;
    for module in &loaded {
        let live = published().any(|t| !t.retired.load(Ordering::Relaxed) && t.id == module.id);
        if live || failed.contains_key(&module.id) {
            continue;
        }
        match compile_module(module).and_then(publish) {
            Ok(entries) => {
                debug!("Unwind table for {}: {} rows", module.id, entries);
                added += 1;
            }
            Err(e @ TraceError::TooManyModules(_)) => {
                warn!("Not compiling {}: {e}", module.id);
                break;
            }
            Err(e) => {
                debug!("No unwind table for {}: {e}", module.id);
                failed.insert(module.id.clone(), e.to_string());
            }
        }
    }
    BUILT_FOR.store(generation, Ordering::Release);
    added
}

fn publish(table: ModuleTable) -> Result<usize> {
    let idx = PUBLISHED.load(Ordering::Acquire);
    if idx >= MAX_TABLES {
        return Err(TraceError::TooManyModules(MAX_TABLES));
    }
    let rows = table.entries.len();
    // Leaked on purpose: readers in signal handlers may hold references
    TABLES[idx].store(Box::into_raw(Box::new(table)), Ordering::Release);
    PUBLISHED.store(idx + 1, Ordering::Release);
    Ok(rows)
}

/// Summary of one published table
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: ModuleId,
    pub rows: usize,
    pub retired: bool,
}

/// Lists the published tables, oldest first
#[must_use]
pub fn tables() -> Vec<TableInfo> {
    published()
        .map(|t| TableInfo {
            id: t.id.clone(),
            rows: t.entries.len(),
            retired: t.retired.load(Ordering::Relaxed),
        })
        .collect()
}

/// Reasons modules currently have no table
#[must_use]
pub fn failures() -> Vec<(ModuleId, String)> {
    let failed = FAILED.lock().unwrap_or_else(PoisonError::into_inner);
    failed.iter().flatten().map(|(id, why)| (id.clone(), why.clone())).collect()
}

#[allow(unsafe_code, clippy::cast_possible_truncation)]
fn compile_module(module: &LoadedModule) -> Result<ModuleTable> {
    let path = module.path();
    let text = module.text_span().ok_or_else(|| TraceError::NoUnwindInfo(path_str(path)))?;

    let entries = if module.in_memory {
        let start = module.segments.iter().map(|r| r.start).min().unwrap_or(0);
        let end = module.segments.iter().map(|r| r.end).max().unwrap_or(0);
        let len = usize::try_from(end.saturating_sub(start)).unwrap_or(0);
        // SAFETY: in-memory modules (the vDSO) are mapped readable in full
        // for the lifetime of the process.
        let image = unsafe { std::slice::from_raw_parts(start as usize as *const u8, len) };
        compile_object(image, path)?
    } else {
        let data = fs::read(path)?;
        module.check_file(&data)?;
        compile_object(&data, path)?
    };

    Ok(ModuleTable {
        id: module.id.clone(),
        text,
        entries: entries.into_boxed_slice(),
        retired: AtomicBool::new(false),
    })
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Compiles the `.eh_frame` of an object file into sorted frame rows
pub(crate) fn compile_object(data: &[u8], path: &Path) -> Result<Vec<FrameDesc>> {
    let obj = object::File::parse(data)
        .map_err(|e| TraceError::ObjectParse { path: path_str(path), error: e.to_string() })?;

    let section =
        obj.section_by_name(".eh_frame").ok_or_else(|| TraceError::NoUnwindInfo(path_str(path)))?;
    let eh_frame_data = section
        .data()
        .map_err(|e| TraceError::ObjectParse { path: path_str(path), error: e.to_string() })?;

    let mut bases = BaseAddresses::default().set_eh_frame(section.address());
    if let Some(text) = obj.section_by_name(".text") {
        bases = bases.set_text(text.address());
    }

    let rows = compile_eh_frame(eh_frame_data, &bases);
    if rows.is_empty() {
        return Err(TraceError::NoUnwindInfo(path_str(path)));
    }
    Ok(rows)
}

/// Malformed entries are skipped; a truncated section yields the rows
/// decoded before the damage.
fn compile_eh_frame(eh_frame_data: &[u8], bases: &BaseAddresses) -> Vec<FrameDesc> {
    let eh_frame = EhFrame::new(eh_frame_data, NativeEndian);
    let mut ctx = UnwindContext::new();
    let mut cies = HashMap::new();
    // (row, is_gap) so real rows sort after gap markers at the same pc
    let mut rows: Vec<(FrameDesc, bool)> = Vec::new();

    let mut entries = eh_frame.entries(bases);
    while let Ok(Some(entry)) = entries.next() {
        let partial = match entry {
            CieOrFde::Cie(cie) => {
                cies.insert(cie.offset(), cie);
                continue;
            }
            CieOrFde::Fde(partial) => partial,
        };
        let Ok(fde) = partial.parse(|section, bases, offset| match cies.get(&offset.0) {
            Some(cie) => Ok(cie.clone()),
            None => section.cie_from_offset(bases, offset),
        }) else {
            continue;
        };
        let Ok(mut table) = fde.rows(&eh_frame, bases, &mut ctx) else {
            continue;
        };

        while let Ok(Some(row)) = table.next_row() {
            let cfa = match row.cfa() {
                CfaRule::RegisterAndOffset { register, offset } => {
                    match i32::try_from(*offset) {
                        Ok(off) if *register == reg::SP => Cfa::Sp(off),
                        Ok(off) if *register == reg::FP => Cfa::Fp(off),
                        _ => Cfa::Unsupported,
                    }
                }
                CfaRule::Expression(expr) => {
                    classify_cfa_expression(eh_frame_data, expr.offset, expr.length)
                }
            };
            let desc = FrameDesc {
                pc: row.start_address(),
                cfa,
                fp: saved(row.register(reg::FP)),
                ra: saved(row.register(reg::RA)),
            };
            rows.push((desc, false));
        }

        // Addresses past this FDE belong to code without CFI
        let gap = FrameDesc { pc: fde.end_address(), ..FrameDesc::FRAME_POINTER };
        rows.push((gap, true));
    }

    normalize(rows)
}

fn saved(rule: RegisterRule<usize>) -> Saved {
    match rule {
        RegisterRule::Offset(offset) => i32::try_from(offset).map_or(Saved::Lost, Saved::At),
        RegisterRule::Undefined | RegisterRule::SameValue => Saved::Unchanged,
        _ => Saved::Lost,
    }
}

/// Sorts rows, lets a real row at the same pc replace a gap marker, then
/// drops rows that repeat the rule in effect before them
fn normalize(mut rows: Vec<(FrameDesc, bool)>) -> Vec<FrameDesc> {
    rows.sort_by_key(|(desc, is_gap)| (desc.pc, !*is_gap));

    let mut out: Vec<FrameDesc> = Vec::with_capacity(rows.len());
    for (desc, _) in rows {
        match out.last_mut() {
            Some(last) if last.pc == desc.pc => *last = desc,
            _ => out.push(desc),
        }
    }
    out.dedup_by(|next, prev| next.same_rule(prev));
    out
}

/// Recognizes the CFA expression glibc emits for PLT stubs:
/// `breg7(rsp)+N; breg16(rip)+0; lit15; and; lit11; ge; lit3; shl; plus`,
/// i.e. `rsp + N + ((rip & 15) >= 11 ? 8 : 0)`
fn classify_cfa_expression(eh_frame_data: &[u8], offset: usize, length: usize) -> Cfa {
    use gimli::Operation;

    if cfg!(not(target_arch = "x86_64")) {
        return Cfa::Unsupported;
    }
    let Some(bytes) = eh_frame_data.get(offset..offset.saturating_add(length)) else {
        return Cfa::Unsupported;
    };
    let expr = gimli::Expression(gimli::EndianSlice::new(bytes, NativeEndian));
    let mut ops = expr.operations(gimli::Encoding {
        address_size: 8,
        format: gimli::Format::Dwarf32,
        version: 4,
    });

    let Ok(Some(Operation::RegisterOffset { register, offset: base, .. })) = ops.next() else {
        return Cfa::Unsupported;
    };
    if register != reg::SP {
        return Cfa::Unsupported;
    }
    match (ops.next(), i32::try_from(base)) {
        (Ok(Some(Operation::RegisterOffset { register: Register(16), offset: 0, .. })), Ok(off)) => {
            Cfa::Plt(off)
        }
        _ => Cfa::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pc: u64, cfa: Cfa) -> FrameDesc {
        FrameDesc { pc, cfa, fp: Saved::Unchanged, ra: Saved::At(-8) }
    }

    #[test]
    fn test_normalize_prefers_real_rows_over_gaps() {
        let gap = FrameDesc { pc: 0x20, ..FrameDesc::FRAME_POINTER };
        let rows = vec![
            (row(0x20, Cfa::Sp(8)), false),
            (gap, true),
            (row(0x10, Cfa::Sp(8)), false),
            (row(0x14, Cfa::Sp(16)), false),
        ];

        let out = normalize(rows);
        assert_eq!(out.iter().map(|r| r.pc).collect::<Vec<_>>(), vec![0x10, 0x14, 0x20]);
        assert_eq!(out[2].cfa, Cfa::Sp(8));
    }

    #[test]
    fn test_normalize_merges_repeated_rules() {
        let rows = vec![
            (row(0x10, Cfa::Sp(8)), false),
            (row(0x18, Cfa::Sp(8)), false),
            (row(0x20, Cfa::Sp(16)), false),
        ];
        let out = normalize(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].pc, 0x20);
    }

    #[test]
    fn test_table_find_uses_bias() {
        let table = ModuleTable {
            id: ModuleId { bias: 0x1000, path: Path::new("/lib/x.so").into(), build_id: None },
            text: MemoryRange { start: 0x1000, end: 0x2000 },
            entries: vec![row(0x100, Cfa::Sp(8)), row(0x180, Cfa::Sp(16))].into_boxed_slice(),
            retired: AtomicBool::new(false),
        };

        assert_eq!(table.find(0x10ff), None);
        assert_eq!(table.find(0x1100).map(|r| r.cfa), Some(Cfa::Sp(8)));
        assert_eq!(table.find(0x11ff).map(|r| r.cfa), Some(Cfa::Sp(16)));
    }

    #[test]
    fn test_compile_rejects_garbage() {
        let err = compile_object(b"not an object file", Path::new("/tmp/garbage")).unwrap_err();
        assert!(matches!(err, TraceError::ObjectParse { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_compile_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let data = fs::read(&exe).unwrap();
        let rows = compile_object(&data, &exe).unwrap();

        assert!(rows.len() > 100);
        assert!(rows.windows(2).all(|w| w[0].pc < w[1].pc));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lookup_after_refresh() {
        ensure_current();
        let pc = test_lookup_after_refresh as usize;

        let desc = lookup(pc + 1).unwrap();
        assert_ne!(desc.cfa, Cfa::Unsupported);
        assert!(tables().iter().any(|t| !t.retired && t.rows > 0));
    }

    #[cfg(all(target_os = "linux", any(target_env = "gnu", target_env = "musl")))]
    #[allow(unsafe_code)]
    #[test]
    fn test_library_loaded_after_first_walk_gets_a_table() {
        use std::ffi::CStr;

        let candidates: [(&CStr, &CStr); 4] = [
            (c"libexpat.so.1", c"XML_ParserCreate"),
            (c"libz.so.1", c"zlibVersion"),
            (c"libbz2.so.1.0", c"BZ2_bzlibVersion"),
            (c"libcrypt.so.1", c"crypt"),
        ];

        let mut buf = [0usize; 32];
        assert!(crate::unwind::capture(&mut buf) > 0);

        // SAFETY: dlopen/dlsym with NUL-terminated names; handles are never closed.
        let found = candidates.iter().find_map(|(lib, sym)| unsafe {
            if !libc::dlopen(lib.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD).is_null() {
                return None;
            }
            let handle = libc::dlopen(lib.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
            if handle.is_null() {
                return None;
            }
            let addr = libc::dlsym(handle, sym.as_ptr());
            (!addr.is_null()).then_some((lib, addr as usize))
        });
        let Some((lib, addr)) = found else {
            println!("no loadable library found, skipping");
            return;
        };

        // Without an explicit refresh, the next walk notices the new module
        assert!(crate::unwind::capture(&mut buf) > 0);
        assert!(lookup(addr + 4).is_some(), "no unwind table for {lib:?}");
    }
}
