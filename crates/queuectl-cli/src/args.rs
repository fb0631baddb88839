use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand};
use queuectl_core::domain::WorkerId;

#[derive(Parser, Debug)]
#[command(name = "queuectl", about = "Redis-backed job queue with worker processes", version)]
pub(crate) struct Args {
    /// Path to the JSON config file (defaults to $QUEUECTL_CONFIG or ./data/config.json).
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub(crate) json_logs: bool,
    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Add a job to the queue.
    Enqueue {
        /// Shell command to execute.
        #[arg(short, long)]
        command: String,
        /// Retry budget (defaults to the configured max_retries).
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Start, stop or list workers.
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Show job counts, queue depths and workers.
    Status,
    /// List jobs, optionally filtered by state.
    List {
        /// pending, processing, delayed, completed or dead.
        #[arg(long)]
        state: Option<String>,
    },
    /// Dead letter queue operations.
    #[command(subcommand)]
    Dlq(DlqCommand),
    /// Read or update the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run the retry scheduler in the foreground.
    Scheduler,
    /// Serve the read-only HTTP API.
    Serve {
        /// Address to listen on (defaults to the configured api_listen).
        #[arg(long)]
        listen: Option<String>,
    },
}

impl Command {
    /// Commands that keep running until interrupted log at `info` by default.
    pub(crate) fn is_long_running(&self) -> bool {
        matches!(
            self,
            Command::Scheduler
                | Command::Serve { .. }
                | Command::Worker(WorkerCommand::Run { .. } | WorkerCommand::Start { .. })
        )
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum WorkerCommand {
    /// Spawn worker processes.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Return right after spawning instead of waiting for the workers.
        #[arg(long)]
        detach: bool,
    },
    /// Stop one worker by pid, or all of them.
    #[command(group(ArgGroup::new("target").required(true).args(["pid", "all"])))]
    Stop {
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        all: bool,
    },
    /// List registered workers.
    List,
    /// Run the worker loop in this process (used by `worker start`).
    #[command(hide = true)]
    Run {
        #[arg(long)]
        id: WorkerId,
        #[arg(long)]
        parent_pid: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum DlqCommand {
    /// List dead jobs.
    List,
    /// Move a dead job back to pending with a fresh retry budget.
    Retry { job_id: String },
}

#[derive(Subcommand, Debug)]
pub(crate) enum ConfigCommand {
    /// Set KEY to VALUE and save.
    Set { key: String, value: String },
    /// Print the value of KEY.
    Get { key: String },
    /// Print the whole config.
    Show,
}
