//! CLI module for topoplane
//!
//! Provides command-line interface for:
//! - init: Write a default config and create the data directory
//! - inspect: Cluster summaries
//! - outbox: Pending or dead-lettered side effects
//! - jobs: Migration jobs and their task phases

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{init, inspect, jobs, outbox, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_records, write_response};
