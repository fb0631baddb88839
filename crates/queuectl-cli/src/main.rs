mod api;
mod args;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use queuectl_core::observability::init_tracing;

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    let level = if args.verbose {
        "debug"
    } else if args.command.is_long_running() {
        "info"
    } else {
        "warn"
    };
    init_tracing(args.json_logs, level);

    match commands::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("[ERROR] {error:#}");
            ExitCode::FAILURE
        }
    }
}
