//! Command-line interface for interp-pool.
//!
//! Provides commands for evaluating scripts through a pool, broadcasting a
//! script to every instance, and checking that a pool comes up.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
