//! # queuectl-worker
//!
//! The worker loop and process supervisor for the `queuectl` job queue
//! (spec.md §2 components 4 and 5).
//!
//! `queuectl-core` defines the job model and the `JobStore` contract;
//! this crate drives that contract from two angles:
//!
//! - [`worker_loop::run_worker_loop`] is what a single spawned worker
//!   process runs: claim, execute, classify, retry-or-complete-or-DLQ.
//! - [`supervisor::Supervisor`] is what the CLI process runs to manage
//!   the OS-level lifecycle of those worker processes (spawn, signal,
//!   probe).

pub mod executor;
pub mod supervisor;
pub mod worker_loop;

pub use executor::{Executor, ShellExecutor};
pub use supervisor::{Supervisor, WorkerState, WorkerStatus, WORKER_ENTRYPOINT_ARG};
pub use worker_loop::{run_worker_loop, ShutdownToken, WorkerConfig};
