//! Command-line interface definitions using clap.

use clap::{Args, Parser, Subcommand};
use clusterbus::logging::LogFormat;
use std::ffi::OsString;
use std::path::PathBuf;

/// Primary/worker process supervisor with a request/response bus.
#[derive(Parser, Debug)]
#[command(name = "clusterbus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, global = true, env = "CLUSTERBUS_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true, env = "CLUSTERBUS_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Global flags to hand down to spawned workers.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if self.verbose > 0 {
            args.push(format!("-{}", "v".repeat(self.verbose as usize)).into());
        }
        if self.quiet {
            args.push("--quiet".into());
        }
        if let Some(format) = self.log_format {
            args.push("--log-format".into());
            args.push(format.to_string().into());
        }
        if let Some(path) = &self.log_file {
            args.push("--log-file".into());
            args.push(path.clone().into_os_string());
        }
        args
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the primary and its workers.
    Serve(ServeArgs),

    /// Run one worker (spawned by the primary).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Number of workers (defaults to the number of CPU cores).
    #[arg(long, short = 'w')]
    pub workers: Option<usize>,

    /// Run a single process without workers.
    #[arg(long)]
    pub standalone: bool,

    /// Advisory port, reported in logs.
    #[arg(long, short = 'p', env = "PORT")]
    pub port: Option<u16>,
}

/// Arguments for the hidden worker command.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Ordinal assigned by the primary.
    #[arg(long)]
    pub worker_id: usize,
}
