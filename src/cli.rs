// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `depmake`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "depmake",
    version,
    about = "Build targets, discovering hidden deps from the jobs that make them.",
    long_about = None
)]
pub struct CliArgs {
    /// Target paths to bring up to date.
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Depmake.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DEPMAKE_LOG` or a default level is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print rules, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
