//! Argument parsing (spec.md §6's CLI surface). This module is the
//! boundary adapter spec.md §1 calls out as deliberately out of the
//! core's scope; it only ever translates argv into calls on
//! `queuectl-core`/`queuectl-worker`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "queuectl", about = "A CLI-based background job queue system.")]
pub struct Cli {
    /// Directory holding queue.db, config.json, and workers.pid.
    #[arg(long, global = true, env = "QUEUECTL_DATA_DIR", default_value = ".queuectl_data")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a new job to the queue.
    Enqueue {
        /// The job specification as a JSON string, e.g. '{"command":"sleep 2"}'.
        job_spec: String,
    },

    /// Manage worker processes.
    Worker {
        #[command(subcommand)]
        action: WorkerCommand,
    },

    /// Show a summary of job states and active workers.
    Status,

    /// List jobs by state.
    #[command(name = "list")]
    ListJobs {
        /// The job state to list.
        #[arg(long, short = 's', default_value = "pending")]
        state: String,
    },

    /// Manage the Dead Letter Queue.
    Dlq {
        #[command(subcommand)]
        action: DlqCommand,
    },

    /// Read or write configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Internal: runs a single worker's steady-state loop. Spawned by
    /// `worker start`; not meant to be invoked directly.
    #[command(name = "__worker-run", hide = true)]
    WorkerRun,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Start one or more worker processes in the background.
    Start {
        /// Number of worker processes to start.
        #[arg(long, short = 'c', default_value_t = 1)]
        count: u32,
    },
    /// Stop all running worker processes gracefully.
    Stop,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List all jobs in the Dead Letter Queue.
    List,
    /// Move a specific job from the DLQ back to the pending queue.
    Retry {
        /// The id of the DLQ job to retry.
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the current configuration.
    Show,
    /// Set a configuration value.
    Set {
        /// Config key to set (e.g. "max_retries").
        key: String,
        /// Value to set.
        value: String,
    },
}
