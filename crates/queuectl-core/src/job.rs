//! The job record and its state machine.
//!
//! A [`Job`] is the single entity this crate revolves around: a shell
//! command with a retry budget, tracked through [`JobState`] from
//! enqueue to a terminal outcome.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states for a [`Job`].
///
/// `Dead` only ever appears on rows stored in the DLQ table; a job in the
/// active `jobs` table is never `Dead` (see the store-level invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    /// All states, in the order `Stats()` reports them.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// A single unit of work: a shell command with a retry policy and a
/// durable lifecycle state.
///
/// Field names and their wire form mirror spec.md §3/§6 verbatim so that
/// `serde_json::to_value(&job)` is the exact JSON the CLI's `enqueue`,
/// `list`, and `dlq list` commands read and print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Build a new job in `Pending` state, as `AddJob`/`RetryFromDLQ` do.
    ///
    /// `id` is generated as a random 128-bit identifier when the caller
    /// doesn't supply one (spec.md §3).
    pub fn new(id: Option<String>, command: String, max_retries: u32) -> Self {
        let now = now_iso8601();
        Job {
            id: id.unwrap_or_else(generate_id),
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Generates a fresh job id: a random v4 UUID rendered as text.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The current instant as an ISO-8601 UTC timestamp.
///
/// `updated_at` comparisons throughout the store rely on this format
/// being lexicographically monotonic (spec.md §3's invariant), which
/// `DateTime::to_rfc3339` with a fixed-offset `Z` suffix satisfies.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// The outcome of one command execution attempt (spec.md §4.3 step 3).
///
/// Only `Success` counts as success; the other three variants are all
/// "failure" for retry/DLQ purposes, but are logged distinctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure { exit_code: Option<i32> },
    Timeout,
    ExecutorError { message: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }
}
