//! Command-line interface of the `nativetrace` diagnostic binary

mod args;

pub use args::{Args, Command};
