//! # queuectl-core
//!
//! The job model and dispatch primitives for `queuectl`: a durable,
//! multi-worker background job queue.
//!
//! ## Core Concepts
//!
//! A [`Job`] moves through a small state machine (`Pending` ->
//! `Processing` -> `Completed`/`Failed`/`Dead`) driven entirely by the
//! operations on [`JobStore`]. This crate defines the trait and the data
//! it moves; `queuectl-store-sqlite` provides the concrete, transactional
//! implementation, and `queuectl-worker` drives it.
//!
//! ## Key Invariants
//!
//! 1. `id` is unique across the union of the active table and the DLQ.
//! 2. A DLQ entry always has `state = Dead`; an active entry never does.
//! 3. `attempts <= max_retries` while active; `attempts >= max_retries`
//!    once dead.
//! 4. `updated_at` never decreases for a given id.
//!
//! See the job-level state machine in [`job::JobState`] and the
//! store contract in [`store::JobStore`] for the operations that
//! preserve these invariants.

pub mod config;
pub mod error;
pub mod job;
pub mod store;

pub use config::{Config, DataDir};
pub use error::{QueueError, Result};
pub use job::{generate_id, now_iso8601, ExecutionOutcome, Job, JobState};
pub use store::{JobStore, QueueStats};
