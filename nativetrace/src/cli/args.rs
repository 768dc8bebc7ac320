//! CLI argument definitions

use clap::{Parser, Subcommand};

use crate::config::{Config, MAX_CONTEXT_SKIP};
use crate::domain::Backend;

#[derive(Parser)]
#[command(
    name = "nativetrace",
    about = "Inspect native stack unwinding and symbolization in this process",
    after_help = "\
EXAMPLES:
    nativetrace trace                        Unwind a built-in call chain and symbolize it
    nativetrace trace --backend fast         Same, using only the dynamic symbol table
    nativetrace modules                      List loaded modules and their unwind tables
    nativetrace stats                        Trace once, then print the counters

ENVIRONMENT:
    NATIVETRACE_SYMBOLIZER, NATIVETRACE_CONTEXT_SKIP, NATIVETRACE_DISABLE and
    NATIVETRACE_EAGER_TABLES provide defaults; flags take precedence."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Symbolizer backend (fast, debuginfo)
    #[arg(short, long, global = true)]
    pub backend: Option<Backend>,

    /// Frames above the context callback left out of boundary stacks
    #[arg(long, global = true, value_name = "N")]
    pub context_skip: Option<usize>,

    /// Start with tracing disabled
    #[arg(long, global = true)]
    pub disable: bool,

    /// Compile unwind tables for every module at startup
    #[arg(long, global = true)]
    pub eager_tables: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Unwind a fixture call chain and print the symbolized frames
    Trace {
        /// Maximum number of frames to record
        #[arg(short, long, default_value = "64")]
        depth: usize,

        /// Go through the context callback first and trace from its token
        #[arg(long)]
        via_context: bool,
    },
    /// List loaded modules with unwind-table and debug-info status
    Modules,
    /// Trace once and print the engine counters
    Stats,
}

impl Default for Command {
    fn default() -> Self {
        Command::Trace { depth: 64, via_context: false }
    }
}

impl Args {
    /// Applies the flags on top of `base` (usually `Config::from_env()`)
    #[must_use]
    pub fn config(&self, base: Config) -> Config {
        let mut config = base;
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(skip) = self.context_skip {
            config.context_skip = skip.min(MAX_CONTEXT_SKIP);
        }
        if self.disable {
            config.enabled = false;
        }
        if self.eager_tables {
            config.eager_tables = true;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_base() {
        let args = Args::parse_from(["nativetrace", "trace", "--backend", "fast", "--disable"]);
        let config = args.config(Config::default());

        assert_eq!(config.backend, Backend::Fast);
        assert!(!config.enabled);
        assert_eq!(args.command, Some(Command::Trace { depth: 64, via_context: false }));
    }

    #[test]
    fn test_no_flags_keep_base() {
        let args = Args::parse_from(["nativetrace"]);
        let base = Config { context_skip: 5, ..Config::default() };

        assert_eq!(args.config(base.clone()), base);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Args::try_parse_from(["nativetrace", "--backend", "gdb"]).is_err());
    }

    #[test]
    fn test_context_skip_is_capped() {
        let args = Args::parse_from(["nativetrace", "--context-skip", "100000"]);
        assert_eq!(args.config(Config::default()).context_skip, MAX_CONTEXT_SKIP);
    }
}
