//! Entry point: parses argv, wires up logging, and dispatches to a
//! handler in [`commands`]. Kept thin on purpose — every decision with
//! domain meaning lives in `queuectl-core`/`queuectl-store-sqlite`/
//! `queuectl-worker`; this binary only adapts the OS boundary.

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use queuectl_core::{Config, DataDir};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The long-running worker path gets the full env-filterable
    // subscriber; one-shot CLI commands get a terse stderr line so
    // stdout stays clean for scriptable output (spec.md §6's output is
    // consumed by operators piping `list`/`dlq list` through `jq`).
    if matches!(cli.command, Command::WorkerRun) {
        init_logging_full();
    } else {
        init_logging_simple();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let data_dir = DataDir::new(cli.data_dir);
    if let Err(e) = data_dir.ensure_exists() {
        eprintln!("Error: failed to create data directory: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(&data_dir.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Enqueue { job_spec } => commands::enqueue(&data_dir, &config, &job_spec).await,
        Command::Worker { action } => commands::worker(&data_dir, &action).await,
        Command::Status => commands::status(&data_dir, &config).await,
        Command::ListJobs { state } => commands::list_jobs(&data_dir, &config, &state).await,
        Command::Dlq { action } => commands::dlq(&data_dir, &config, &action).await,
        Command::Config { action } => commands::config(&data_dir, &action),
        Command::WorkerRun => commands::worker_run(&data_dir, &config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging_simple() {
    tracing_subscriber::fmt()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn init_logging_full() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}
