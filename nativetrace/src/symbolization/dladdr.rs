//! Fast backend: the dynamic loader's exported-symbol lookup
//!
//! Answers with the nearest exported symbol at or below the address and the
//! containing module. No source lines, no inlined frames.

use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use smallvec::smallvec;

use super::demangle::demangle;
use super::symbolizer::{InlinedFrame, InlinedFrames, Symbolizer};
use crate::domain::{Result, TraceError};

#[derive(Debug, Clone, Copy, Default)]
pub struct DladdrSymbolizer;

impl DladdrSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Symbolizer for DladdrSymbolizer {
    fn name(&self) -> &'static str {
        "fast"
    }

    #[allow(unsafe_code)]
    fn addr_to_symbols(&self, addr: u64) -> Result<InlinedFrames> {
        let ptr = usize::try_from(addr).map_err(|_| TraceError::ModuleNotFound(addr))?;
        // SAFETY: an all-zero Dl_info is a valid out-parameter
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only inspects loader data structures for the address
        if unsafe { libc::dladdr(ptr as *const libc::c_void, &mut info) } == 0 {
            return Err(TraceError::ModuleNotFound(addr));
        }

        let module = (!info.dli_fname.is_null()).then(|| {
            // SAFETY: non-null loader strings are NUL-terminated and live
            // as long as the module stays loaded
            let name = unsafe { CStr::from_ptr(info.dli_fname) };
            Arc::<Path>::from(PathBuf::from(name.to_string_lossy().into_owned()))
        });
        let function = (!info.dli_sname.is_null()).then(|| {
            // SAFETY: as above
            demangle(&unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy())
        });
        let entry = if function.is_some() { info.dli_saddr as u64 } else { 0 };

        Ok(smallvec![InlinedFrame { function, location: None, entry, module }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_libc_export() {
        let addr = libc::getpid as usize as u64;
        let frames = DladdrSymbolizer.addr_to_symbols(addr).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].function.as_deref().unwrap().contains("getpid"));
        assert!(frames[0].module.is_some());
        assert!(frames[0].entry <= addr);
        assert_eq!(frames[0].line(), 0);
    }

    #[test]
    fn test_unmapped_address() {
        assert!(matches!(
            DladdrSymbolizer.addr_to_symbols(0x10),
            Err(TraceError::ModuleNotFound(0x10))
        ));
    }
}
