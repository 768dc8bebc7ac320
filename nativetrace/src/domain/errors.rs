//! Structured error types for nativetrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever cross a host callback: the operations that the runtime
//! calls absorb them and return partial or empty results instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("No loaded module contains address {0:#x}")]
    ModuleNotFound(u64),

    #[error("No debug information in {0}")]
    NoDebugInfo(String),

    #[error("No unwind information in {0}")]
    NoUnwindInfo(String),

    #[error("Failed to parse object file {path}: {error}")]
    ObjectParse { path: String, error: String },

    #[error("Failed to read DWARF from {path}: {error}")]
    Dwarf { path: String, error: String },

    #[error("{0} was replaced on disk after it was loaded")]
    StaleFile(String),

    #[error("Unwind table registry is full ({0} modules)")]
    TooManyModules(usize),

    #[error("Invalid value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_not_found_display() {
        let err = TraceError::ModuleNotFound(0x7f00_dead_beef);
        assert_eq!(err.to_string(), "No loaded module contains address 0x7f00deadbeef");
    }

    #[test]
    fn test_object_parse_error() {
        let err = TraceError::ObjectParse {
            path: "/usr/lib/libfoo.so".to_string(),
            error: "Unknown file magic".to_string(),
        };
        assert!(err.to_string().contains("/usr/lib/libfoo.so"));
        assert!(err.to_string().contains("Unknown file magic"));
    }

    #[test]
    fn test_invalid_config_error() {
        let err = TraceError::InvalidConfig {
            key: "NATIVETRACE_SYMBOLIZER".to_string(),
            value: "libdwfl".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid value for NATIVETRACE_SYMBOLIZER: libdwfl");
    }
}
