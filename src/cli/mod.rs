//! Command-line interface for cron-runner.
//!
//! Provides the long-running `serve` command plus one-shot `run` and
//! `publish` helpers for operating the service by hand.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
