//! Engine configuration
//!
//! Defaults suit a host that calls the context callback from exactly one
//! runtime frame. Every knob can be overridden from the environment, which is
//! the only channel a host process gives us before the first callback fires.

use crate::domain::{Backend, Result, TraceError};

pub const ENV_SYMBOLIZER: &str = "NATIVETRACE_SYMBOLIZER";
pub const ENV_CONTEXT_SKIP: &str = "NATIVETRACE_CONTEXT_SKIP";
pub const ENV_DISABLE: &str = "NATIVETRACE_DISABLE";
pub const ENV_EAGER_TABLES: &str = "NATIVETRACE_EAGER_TABLES";

/// Frames between the context tracker and the native boundary frame: the
/// context callback itself and the host runtime frame that invoked it
pub const DEFAULT_CONTEXT_SKIP: usize = 2;

/// Largest accepted `context_skip`; boundary stacks never get deeper than this
pub const MAX_CONTEXT_SKIP: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Symbolizer backend used by the resolver
    pub backend: Backend,

    /// Frames above the context tracker left out of cached boundary stacks
    pub context_skip: usize,

    /// Whether the enable gate starts open
    pub enabled: bool,

    /// Compile unwind tables for every loaded module during initialization
    /// instead of on first use
    pub eager_tables: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "debuginfo") { Backend::DebugInfo } else { Backend::Fast },
            context_skip: DEFAULT_CONTEXT_SKIP,
            enabled: true,
            eager_tables: false,
        }
    }
}

impl Config {
    /// Builds a configuration from `NATIVETRACE_*` environment variables
    ///
    /// # Errors
    /// Returns `TraceError::InvalidConfig` if a variable is set to a value
    /// that cannot be parsed
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source
    ///
    /// # Errors
    /// Returns `TraceError::InvalidConfig` on unparseable values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(value) = lookup(ENV_SYMBOLIZER) {
            config.backend = value.parse().map_err(|_| invalid(ENV_SYMBOLIZER, &value))?;
        }
        if let Some(value) = lookup(ENV_CONTEXT_SKIP) {
            config.context_skip = value
                .trim()
                .parse()
                .ok()
                .filter(|&skip| skip <= MAX_CONTEXT_SKIP)
                .ok_or_else(|| invalid(ENV_CONTEXT_SKIP, &value))?;
        }
        if let Some(value) = lookup(ENV_DISABLE) {
            config.enabled = !parse_flag(ENV_DISABLE, &value)?;
        }
        if let Some(value) = lookup(ENV_EAGER_TABLES) {
            config.eager_tables = parse_flag(ENV_EAGER_TABLES, &value)?;
        }

        Ok(config)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> TraceError {
    TraceError::InvalidConfig { key: key.to_string(), value: value.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.context_skip, DEFAULT_CONTEXT_SKIP);
        assert!(config.enabled);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_SYMBOLIZER, "fast"),
            (ENV_CONTEXT_SKIP, " 4 "),
            (ENV_DISABLE, "yes"),
            (ENV_EAGER_TABLES, "1"),
        ]))
        .unwrap();

        assert_eq!(config.backend, Backend::Fast);
        assert_eq!(config.context_skip, 4);
        assert!(!config.enabled);
        assert!(config.eager_tables);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[(ENV_CONTEXT_SKIP, "-1")])).unwrap_err();
        assert!(err.to_string().contains(ENV_CONTEXT_SKIP));

        let huge = usize::MAX.to_string();
        for value in [huge.as_str(), "65"] {
            let err = Config::from_lookup(lookup_from(&[(ENV_CONTEXT_SKIP, value)])).unwrap_err();
            assert!(matches!(err, TraceError::InvalidConfig { .. }), "{value} accepted");
        }
        let config = Config::from_lookup(lookup_from(&[(ENV_CONTEXT_SKIP, "64")])).unwrap();
        assert_eq!(config.context_skip, MAX_CONTEXT_SKIP);

        let err = Config::from_lookup(lookup_from(&[(ENV_DISABLE, "maybe")])).unwrap_err();
        assert!(matches!(err, TraceError::InvalidConfig { .. }));
    }
}
