//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep raw words coming from the host runtime apart
//! from addresses and counts, and make function signatures more expressive.

use std::fmt;

/// Per-call-site context token
///
/// Handed to the host when native code is entered and handed back when the
/// native call returns. The null token means "no context".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CallContext(pub usize);

impl CallContext {
    /// The null token
    pub const NULL: CallContext = CallContext(0);

    /// Returns true if this is the null token
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ctx:null")
        } else {
            write!(f, "ctx:{:#x}", self.0)
        }
    }
}

impl From<usize> for CallContext {
    fn from(raw: usize) -> Self {
        CallContext(raw)
    }
}

impl From<CallContext> for usize {
    fn from(ctx: CallContext) -> Self {
        ctx.0
    }
}

/// Symbolizer backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Dynamic symbol table lookup (`dladdr`): function and module, no lines
    #[default]
    Fast,
    /// DWARF line tables and inlining chains, falling back to [`Backend::Fast`]
    DebugInfo,
}

impl Backend {
    /// Name used in configuration and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Backend::Fast => "fast",
            Backend::DebugInfo => "debuginfo",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "dladdr" => Ok(Backend::Fast),
            "debuginfo" | "dwarf" => Ok(Backend::DebugInfo),
            other => Err(format!("unknown symbolizer backend \"{other}\"")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_context_null() {
        assert!(CallContext::NULL.is_null());
        assert!(!CallContext(0x1000).is_null());
        assert_eq!(CallContext::default(), CallContext::NULL);
        assert_eq!(CallContext(0x10).to_string(), "ctx:0x10");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("fast".parse::<Backend>(), Ok(Backend::Fast));
        assert_eq!("DWARF".parse::<Backend>(), Ok(Backend::DebugInfo));
        assert!("libdwfl".parse::<Backend>().is_err());
    }
}
