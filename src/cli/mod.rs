//! Command-line interface for blockq.
//!
//! Provides commands to run a producer/consumer pair, run either side alone,
//! and exercise the list, key/value and cache helpers.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
