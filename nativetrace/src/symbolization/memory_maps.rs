//! Loaded module enumeration
//!
//! Lists the native modules mapped into this process (the executable and
//! every shared object) together with their load bias and the runtime
//! address ranges of their loadable segments. Both the unwind tables and the
//! debug-info module cache are keyed on this information.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use object::Object;

use crate::domain::{Result, TraceError};

/// Memory range of a loaded segment in this process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn overlaps(&self, other: &MemoryRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Identity of a loaded module: the file it came from and where it sits
///
/// `bias` is the difference between runtime and link-time addresses, so
/// `runtime = svma + bias`. The GNU build ID, when the module carries one,
/// tells apart a rebuilt file reopened from the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub bias: u64,
    pub path: Arc<Path>,
    pub build_id: Option<Arc<[u8]>>,
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.path.display(), self.bias)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub id: ModuleId,
    /// Runtime ranges of all `PT_LOAD` segments
    pub segments: Vec<MemoryRange>,
    /// Runtime ranges of the executable segments
    pub text: Vec<MemoryRange>,
    /// The ELF image is mapped in full and readable in place (vDSO)
    pub in_memory: bool,
}

impl LoadedModule {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.segments.iter().any(|s| s.contains(addr))
    }

    /// Smallest range covering every executable segment
    #[must_use]
    pub fn text_span(&self) -> Option<MemoryRange> {
        let start = self.text.iter().map(|r| r.start).min()?;
        let end = self.text.iter().map(|r| r.end).max()?;
        Some(MemoryRange { start, end })
    }

    /// Returns true if any segment of `self` overlaps any segment of `other`
    #[must_use]
    pub fn overlaps(&self, other: &LoadedModule) -> bool {
        self.segments.iter().any(|a| other.segments.iter().any(|b| a.overlaps(b)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.id.path
    }

    /// Checks that `data`, read from the module's path, is the file that was
    /// mapped
    ///
    /// Passes when either side has no build ID.
    ///
    /// # Errors
    /// Returns `TraceError::StaleFile` when the build IDs differ
    pub fn check_file(&self, data: &[u8]) -> Result<()> {
        let Some(expected) = self.id.build_id.as_deref() else {
            return Ok(());
        };
        let on_disk = object::File::parse(data).ok().and_then(|obj| obj.build_id().ok().flatten());
        match on_disk {
            Some(found) if found != expected => {
                Err(TraceError::StaleFile(self.path().display().to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Source of loaded-module information
///
/// The process implementation walks the dynamic loader's list; tests supply
/// their own to simulate modules being unloaded and replaced.
pub trait ModuleSource: Send + Sync {
    /// Every module currently mapped
    fn loaded(&self) -> Vec<LoadedModule>;

    /// The module containing `addr`, if any
    fn locate(&self, addr: u64) -> Option<LoadedModule> {
        self.loaded().into_iter().find(|m| m.contains(addr))
    }
}

/// Modules of the current process as reported by the dynamic loader
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessModules;

impl ModuleSource for ProcessModules {
    fn loaded(&self) -> Vec<LoadedModule> {
        let mut modules = Vec::new();
        for_each_module(|module| {
            modules.push(module);
            true
        });
        modules
    }

    fn locate(&self, addr: u64) -> Option<LoadedModule> {
        let mut found = None;
        for_each_module(|module| {
            if module.contains(addr) {
                found = Some(module);
                false
            } else {
                true
            }
        });
        found
    }
}

/// Lists the modules of the current process
#[must_use]
pub fn loaded_modules() -> Vec<LoadedModule> {
    ProcessModules.loaded()
}

/// Path of the running executable, resolved once
fn executable_path() -> Option<&'static Path> {
    static EXE: OnceLock<Option<PathBuf>> = OnceLock::new();
    EXE.get_or_init(|| std::env::current_exe().ok()).as_deref()
}

/// Finds the `NT_GNU_BUILD_ID` descriptor in the contents of a note segment
fn gnu_build_id(mut notes: &[u8]) -> Option<&[u8]> {
    const HEADER: usize = 12;
    let align4 = |n: usize| n.checked_add(3).map(|n| n & !3);
    let word = |b: &[u8], at: usize| -> Option<u32> {
        let bytes: [u8; 4] = b.get(at..at + 4)?.try_into().ok()?;
        Some(u32::from_ne_bytes(bytes))
    };

    while notes.len() >= HEADER {
        let namesz = usize::try_from(word(notes, 0)?).ok()?;
        let descsz = usize::try_from(word(notes, 4)?).ok()?;
        let kind = word(notes, 8)?;
        let desc_at = align4(HEADER.checked_add(namesz)?)?;
        let next = align4(desc_at.checked_add(descsz)?)?;

        let name = notes.get(HEADER..HEADER.checked_add(namesz)?)?;
        let desc = notes.get(desc_at..desc_at.checked_add(descsz)?)?;
        if kind == object::elf::NT_GNU_BUILD_ID
            && name.strip_suffix(b"\0").unwrap_or(name) == object::elf::ELF_NOTE_GNU
            && !desc.is_empty()
        {
            return Some(desc);
        }
        notes = notes.get(next..).unwrap_or(&[]);
    }
    None
}

/// Counter that changes whenever the dynamic loader adds or removes a
/// module, or `0` where the loader does not report one
///
/// Costs one `dl_iterate_phdr` callback. Not signal-safe.
#[cfg(all(target_os = "linux", any(target_env = "gnu", target_env = "musl")))]
#[allow(unsafe_code)]
#[must_use]
pub fn loader_generation() -> u64 {
    use std::ffi::{c_int, c_void};

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        // Older loaders hand out a shorter struct without the counters
        if size < std::mem::size_of::<libc::dl_phdr_info>() {
            return 1;
        }
        // SAFETY: `data` is the u64 below, `info` is valid for this call and
        // large enough to hold the counters.
        unsafe {
            let info = &*info;
            *data.cast::<u64>() = info.dlpi_adds.wrapping_add(info.dlpi_subs);
        }
        1
    }

    let mut generation = 0u64;
    // SAFETY: the callback writes only `generation` and stops after the
    // first module.
    unsafe {
        libc::dl_iterate_phdr(Some(callback), std::ptr::addr_of_mut!(generation).cast());
    }
    generation
}

#[cfg(not(all(target_os = "linux", any(target_env = "gnu", target_env = "musl"))))]
#[must_use]
pub fn loader_generation() -> u64 {
    0
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
#[allow(unsafe_code)]
fn for_each_module(mut visit: impl FnMut(LoadedModule) -> bool) {
    use std::ffi::{c_int, c_void, CStr};

    const PT_LOAD: u32 = 1;
    const PT_NOTE: u32 = 4;
    const PF_X: u32 = 1;

    struct Walk<'a> {
        visit: &'a mut dyn FnMut(LoadedModule) -> bool,
        index: usize,
    }

    // Header field widths follow the target's ELF class
    #[allow(clippy::useless_conversion)]
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        // SAFETY: `data` is the `Walk` passed to dl_iterate_phdr below and
        // `info` is valid for the duration of this call.
        let (walk, info) = unsafe { (&mut *data.cast::<Walk<'_>>(), &*info) };
        let index = walk.index;
        walk.index += 1;

        let name = if info.dlpi_name.is_null() {
            None
        } else {
            // SAFETY: the loader hands out NUL-terminated names.
            Some(unsafe { CStr::from_ptr(info.dlpi_name) })
        };
        let path = match name.map(CStr::to_bytes) {
            Some(bytes) if !bytes.is_empty() => {
                PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
            }
            // The executable is reported first, without a name
            _ if index == 0 => match executable_path() {
                Some(exe) => exe.to_path_buf(),
                None => return 0,
            },
            _ => return 0,
        };

        let bias = u64::from(info.dlpi_addr);
        let phdrs = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            // SAFETY: the loader guarantees `dlpi_phnum` headers at `dlpi_phdr`.
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) }
        };

        let mut segments = Vec::new();
        let mut text = Vec::new();
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            let start = bias.wrapping_add(u64::from(phdr.p_vaddr));
            let range = MemoryRange { start, end: start.wrapping_add(u64::from(phdr.p_memsz)) };
            segments.push(range);
            if phdr.p_flags & PF_X != 0 {
                text.push(range);
            }
        }
        if segments.is_empty() {
            return 0;
        }

        let mut build_id = None;
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_NOTE) {
            let start = bias.wrapping_add(u64::from(phdr.p_vaddr));
            let end = start.wrapping_add(u64::from(phdr.p_filesz));
            let mapped = segments.iter().any(|s| s.start <= start && end <= s.end);
            let (Ok(addr), Ok(len)) = (usize::try_from(start), usize::try_from(u64::from(phdr.p_filesz))) else {
                continue;
            };
            if !mapped || len == 0 {
                continue;
            }
            // SAFETY: the note lies inside one of the module's PT_LOAD
            // segments, which stay mapped while the loader lock is held.
            let notes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
            if let Some(id) = gnu_build_id(notes) {
                build_id = Some(Arc::from(id));
                break;
            }
        }

        // The vDSO is named after its soname and has no file behind it
        let in_memory = path.to_string_lossy().starts_with("linux-") && !path.exists();
        let module = LoadedModule {
            id: ModuleId { bias, path: Arc::from(path), build_id },
            segments,
            text,
            in_memory,
        };

        if (walk.visit)(module) {
            0
        } else {
            1
        }
    }

    let mut walk = Walk { visit: &mut visit, index: 0 };
    // SAFETY: `callback` only touches `walk` through the data pointer while
    // dl_iterate_phdr runs.
    unsafe {
        libc::dl_iterate_phdr(Some(callback), std::ptr::addr_of_mut!(walk).cast());
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn for_each_module(_visit: impl FnMut(LoadedModule) -> bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0x2001));
    }

    #[test]
    fn test_memory_range_overlaps() {
        let a = MemoryRange { start: 0x1000, end: 0x2000 };
        assert!(a.overlaps(&MemoryRange { start: 0x1fff, end: 0x3000 }));
        assert!(!a.overlaps(&MemoryRange { start: 0x2000, end: 0x3000 }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_executable_is_listed_first() {
        let modules = loaded_modules();
        let exe = std::env::current_exe().unwrap();

        assert!(!modules.is_empty());
        assert_eq!(&*modules[0].id.path, exe.as_path());
        assert!(modules[0].text_span().is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_executable_build_id_matches_file_on_disk() {
        let exe = loaded_modules().swap_remove(0);
        let data = std::fs::read(exe.path()).unwrap();
        let on_disk = object::File::parse(&*data).unwrap().build_id().unwrap();

        assert_eq!(exe.id.build_id.as_deref(), on_disk);
        assert!(exe.check_file(&data).is_ok());

        let mut rebuilt = exe.clone();
        rebuilt.id.build_id = Some(Arc::from(&[0u8; 20][..]));
        let check = rebuilt.check_file(&data);
        if on_disk.is_some() {
            assert!(matches!(check, Err(TraceError::StaleFile(_))));
        } else {
            assert!(check.is_ok());
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_locate_own_code() {
        let addr = test_locate_own_code as usize as u64;
        let module = ProcessModules.locate(addr).unwrap();

        assert!(module.contains(addr));
        assert!(module.text.iter().any(|r| r.contains(addr)));
    }

    fn note(name: &[u8], kind: u32, desc: &[u8]) -> Vec<u8> {
        let pad = |v: &mut Vec<u8>| v.resize(v.len().next_multiple_of(4), 0);
        let mut out = Vec::new();
        out.extend_from_slice(&u32::try_from(name.len()).unwrap().to_ne_bytes());
        out.extend_from_slice(&u32::try_from(desc.len()).unwrap().to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(name);
        pad(&mut out);
        out.extend_from_slice(desc);
        pad(&mut out);
        out
    }

    #[test]
    fn test_build_id_found_after_other_notes() {
        let mut notes = note(b"GNU\0", 1, &[0, 0, 0, 0, 3, 2, 0, 0]);
        notes.extend(note(b"GNU\0", 3, &[0xde, 0xad, 0xbe, 0xef, 0x01]));

        assert_eq!(gnu_build_id(&notes), Some(&[0xde, 0xad, 0xbe, 0xef, 0x01][..]));
    }

    #[test]
    fn test_build_id_ignores_other_owners_and_truncation() {
        let foreign = note(b"Go\0\0", 3, &[1, 2, 3, 4]);
        assert_eq!(gnu_build_id(&foreign), None);

        let whole = note(b"GNU\0", 3, &[9; 20]);
        assert_eq!(gnu_build_id(&whole[..whole.len() - 8]), None);
        assert_eq!(gnu_build_id(&[]), None);
    }

    #[test]
    fn test_executable_path_is_resolved_once() {
        let exe = executable_path().unwrap();
        assert!(std::ptr::eq(exe, executable_path().unwrap()));
    }

    #[cfg(all(target_os = "linux", any(target_env = "gnu", target_env = "musl")))]
    #[test]
    fn test_loader_generation_never_goes_back() {
        let first = loader_generation();
        assert!(first > 0);
        assert!(loader_generation() >= first);
    }
}
