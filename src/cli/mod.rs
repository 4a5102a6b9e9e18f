//! Command-line interface for repocate.
//!
//! Provides commands for cloning repositories, managing their development
//! containers and registering plugins.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
