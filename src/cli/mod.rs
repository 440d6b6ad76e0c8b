//! CLI module for mapdiffbot - command-line interface and subcommands.
//!
//! Provides one-shot pipeline runs, single renders, bounds queries and
//! inspection of stored results.

pub mod commands;

pub use commands::Cli;
