// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use std::path::Path;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::domain::Result;
use crate::symbolization::memory_maps::LoadedModule;

/// Logical frames of one address, innermost (most deeply inlined) first
pub type InlinedFrames = SmallVec<[InlinedFrame; 2]>;

/// Resolves instruction addresses of this process to symbols
///
/// Implementations are interchangeable strategies chosen once when the
/// tracer is initialized.
pub trait Symbolizer: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Logical frames for `addr`, innermost first
    ///
    /// An empty list is a valid "nothing known" answer.
    ///
    /// # Errors
    /// Returns an error if the address cannot be attributed to any module.
    fn addr_to_symbols(&self, addr: u64) -> Result<InlinedFrames>;

    /// Called after the set of loaded modules may have changed
    fn refresh(&self) {}

    /// Whether `module` carries DWARF line information, or `None` when the
    /// backend never reads it
    fn has_line_info(&self, _module: &LoadedModule) -> Option<bool> {
        None
    }

    /// Resolve an address for display
    fn resolve(&self, addr: u64) -> ResolvedFrame {
        let frames = self.addr_to_symbols(addr).unwrap_or_default();
        ResolvedFrame { addr, frames: frames.into_vec() }
    }
}

/// A resolved stack frame (may contain multiple inlined frames)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

/// One logical frame at an address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlinedFrame {
    /// Demangled function name
    pub function: Option<String>,
    pub location: Option<SourceLocation>,
    /// Entry address of the containing function, 0 when unknown
    pub entry: u64,
    /// Module containing the address
    pub module: Option<Arc<Path>>,
}

/// Source code location
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl InlinedFrame {
    /// File reported to the host: the source file when known, otherwise the
    /// module path
    #[must_use]
    pub fn file(&self) -> Option<String> {
        self.location
            .as_ref()
            .and_then(|loc| loc.file.clone())
            .or_else(|| self.module.as_ref().map(|m| m.display().to_string()))
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.location.as_ref().and_then(|loc| loc.line).unwrap_or(0)
    }
}

impl ResolvedFrame {
    /// Format the frame for display
    #[must_use]
    pub fn format(&self, frame_num: usize) -> String {
        if self.frames.is_empty() {
            return format!("#{frame_num:<2} 0x{:016x} <unknown>", self.addr);
        }

        let mut output = String::new();

        for (idx, inlined) in self.frames.iter().enumerate() {
            let prefix = if idx == 0 { format!("#{frame_num:<2}") } else { "    ".to_string() };
            let function = inlined.function.as_deref().unwrap_or("<unknown>");

            output.push_str(&format!("{} 0x{:016x} {}", prefix, self.addr, function));

            if let Some(ref loc) = inlined.location {
                if let Some(ref file) = loc.file {
                    output.push_str(&format!("\n                      at {file}"));
                    if let Some(line) = loc.line {
                        output.push_str(&format!(":{line}"));
                        if let Some(col) = loc.column {
                            output.push_str(&format!(":{col}"));
                        }
                    }
                }
            } else if let Some(ref module) = inlined.module {
                output.push_str(&format!("\n                      in {}", module.display()));
            }

            if idx < self.frames.len() - 1 {
                output.push('\n');
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str, file: Option<&str>, line: Option<u32>) -> InlinedFrame {
        InlinedFrame {
            function: Some(function.to_string()),
            location: file.map(|f| SourceLocation {
                file: Some(f.to_string()),
                line,
                column: None,
            }),
            entry: 0,
            module: Some(Arc::from(Path::new("/usr/lib/libdemo.so"))),
        }
    }

    #[test]
    fn test_file_falls_back_to_module() {
        assert_eq!(frame("f", Some("src/a.c"), Some(3)).file().as_deref(), Some("src/a.c"));
        assert_eq!(frame("f", None, None).file().as_deref(), Some("/usr/lib/libdemo.so"));
        assert_eq!(frame("f", None, None).line(), 0);
    }

    #[test]
    fn test_format_inlined_chain() {
        let resolved = ResolvedFrame {
            addr: 0x1234,
            frames: vec![frame("inner", Some("a.c"), Some(10)), frame("outer", Some("a.c"), Some(20))],
        };
        let text = resolved.format(3);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "#3  0x0000000000001234 inner");
        assert_eq!(lines[1].trim(), "at a.c:10");
        assert_eq!(lines[2], "     0x0000000000001234 outer");
    }

    #[test]
    fn test_format_unknown() {
        let resolved = ResolvedFrame { addr: 0x10, frames: Vec::new() };
        assert!(resolved.format(0).ends_with("<unknown>"));
    }
}
