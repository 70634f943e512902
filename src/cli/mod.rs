pub mod commands;

use crate::entry::Level;
use crate::telemetry::LogFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Ship structured log entries to a collector")]
#[command(version)]
pub struct Cli {
    /// Path to a logship.toml config file
    #[arg(long, global = true, env = "LOGSHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Collector URL (overrides config and LOGSHIP_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Source name stamped on every entry
    #[arg(long, global = true)]
    pub source: Option<String>,

    /// Format of logship's own diagnostics on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a single entry and wait for delivery
    Send(SendArgs),
    /// Ship every line read from stdin
    Pipe(PipeArgs),
}

#[derive(clap::Args)]
pub struct SendArgs {
    /// Log message
    pub message: String,

    /// Entry level: debug, info, warn or error
    #[arg(long, default_value = "info")]
    pub level: Level,

    /// JSON value attached as metadata
    #[arg(long)]
    pub meta: Option<String>,

    /// Trace id to attach (generated when the flag is given without a value)
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub trace_id: Option<String>,
}

#[derive(clap::Args)]
pub struct PipeArgs {
    /// Level for lines that do not carry their own
    #[arg(long, default_value = "info")]
    pub level: Level,

    /// Parse each line as a JSON object with `level`/`message` fields; other
    /// fields become metadata
    #[arg(long)]
    pub json: bool,

    /// Echo each line to stdout after queueing it
    #[arg(long)]
    pub tee: bool,
}
