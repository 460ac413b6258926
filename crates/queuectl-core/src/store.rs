//! The `JobStore` trait: the Store's contract (spec.md §4.1), independent
//! of any particular backing database.
//!
//! Grounded in `seesaw-core`'s own `JobStore` trait (`claim_ready`,
//! `mark_succeeded`, `mark_failed`, `heartbeat`), generalized from that
//! trait's "claim a batch under a worker lease" shape to spec.md's
//! "claim exactly one job, atomically, with no lease" shape — this
//! system has no heartbeat-renewable leases, only the coarser
//! `reap_stale` sweep (SPEC_FULL.md §4.1).

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{Job, JobState};

/// Counts of jobs in each state, across both the active and DLQ tables
/// (spec.md §4.1's `Stats()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }
}

/// The Store's operations (spec.md §4.1), each running inside an
/// implicit short transaction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts `job`. Returns `Ok(false)` on a unique-key conflict
    /// rather than an error, per spec.md §4.1.
    async fn add_job(&self, job: &Job) -> Result<bool>;

    /// The atomic claim: selects the oldest `Pending` row, transitions
    /// it to `Processing`, and returns it — or `Ok(None)` if no job was
    /// available, including when the write lock could not be acquired
    /// within the busy-timeout (spec.md §4.1's failure semantics).
    async fn claim_next_pending(&self) -> Result<Option<Job>>;

    /// Updates `state`, `attempts`, and `updated_at` for the row with
    /// the given id.
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Atomically moves `job` into the DLQ with `state = Dead`.
    async fn move_to_dlq(&self, job: &Job) -> Result<()>;

    /// Atomically moves the DLQ entry `id` back into the active table
    /// with `state = Pending, attempts = 0`. Returns `Ok(false)` if `id`
    /// isn't in the DLQ, and errors with `QueueError::Conflict` if an
    /// active job already holds that id (SPEC_FULL.md §9 item 4).
    async fn retry_from_dlq(&self, id: &str) -> Result<bool>;

    /// Jobs in `state`, oldest `created_at` first. For `Dead`, reads the
    /// DLQ table; otherwise the active table.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>>;

    /// Looks up a specific DLQ entry by id.
    async fn find_in_dlq(&self, id: &str) -> Result<Option<Job>>;

    /// Counts of jobs by state across both tables.
    async fn stats(&self) -> Result<QueueStats>;

    /// Returns `Processing` rows whose `updated_at` is older than
    /// `stale_after_secs` back to `Pending`, incrementing their
    /// `attempts`. Resolves the crashed-worker leak (spec.md §9 item 1).
    /// Returns the number of rows reclaimed.
    async fn reap_stale(&self, stale_after_secs: u64) -> Result<u64>;
}
