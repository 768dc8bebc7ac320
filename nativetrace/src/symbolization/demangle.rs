//! Symbol name demangling for Rust (legacy and v0) and Itanium C++ names

use cpp_demangle::{DemangleOptions, Symbol};

/// Demangles `name` if it is a Rust or C++ mangled name, otherwise returns
/// it unchanged
#[must_use]
pub fn demangle(name: &str) -> String {
    if let Ok(rust) = rustc_demangle::try_demangle(name) {
        // `{:#}` drops the trailing hash
        return format!("{rust:#}");
    }
    if name.starts_with("_Z") {
        if let Ok(symbol) = Symbol::new(name) {
            if let Ok(cpp) = symbol.demangle(&DemangleOptions::default()) {
                return cpp;
            }
        }
    }
    name.to_string()
}
