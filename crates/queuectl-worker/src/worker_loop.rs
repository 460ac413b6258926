//! The per-process consumer loop (spec.md §4.3): claim, execute,
//! classify, retry-or-complete-or-DLQ.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use queuectl_core::job::{ExecutionOutcome, Job, JobState};
use queuectl_core::store::JobStore;
use tracing::{info, warn};

use crate::executor::Executor;

/// Idle poll cadence when no job is available (spec.md §4.3 step 1).
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Token flipped by the supervisor's signal handler. Cleanup only ever
/// happens at the top of the loop, so a job mid-execution is never
/// preempted (spec.md §4.4's signal discipline).
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        ShutdownToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tunables the loop needs that live in `config.json`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub backoff_base: u32,
    pub stale_processing_secs: u64,
    /// How often the reaper sweep runs, between claim attempts.
    pub reap_interval: Duration,
    /// The live `max_retries` config value, used when a job's own row
    /// has a non-positive `max_retries` (spec.md §4.3's "otherwise from
    /// current config" fallback).
    pub max_retries_fallback: u32,
}

/// Runs the steady-state loop until `shutdown` is requested.
///
/// Exits only when told to shut down; a storage error from an individual
/// operation is logged and the loop continues (spec.md §7: "internal
/// faults inside the worker loop are logged and do not kill the loop
/// unless the storage layer itself is unusable" — unusability here is
/// left to the caller, which drops the store and exits the process on a
/// persistent failure rather than looping against a broken connection).
pub async fn run_worker_loop(
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    config: WorkerConfig,
    shutdown: ShutdownToken,
) {
    let mut since_last_reap = Duration::ZERO;

    while !shutdown.is_shutting_down() {
        if since_last_reap >= config.reap_interval {
            match store.reap_stale(config.stale_processing_secs).await {
                Ok(0) => {}
                Ok(n) => info!("reaper: reclaimed {n} stale processing job(s)"),
                Err(e) => warn!("reaper sweep failed: {e}"),
            }
            since_last_reap = Duration::ZERO;
        }

        let claimed = match store.claim_next_pending().await {
            Ok(job) => job,
            Err(e) => {
                warn!("claim failed: {e}");
                None
            }
        };

        let Some(mut job) = claimed else {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            since_last_reap += IDLE_POLL_INTERVAL;
            continue;
        };

        job.attempts += 1;
        info!(job_id = %job.id, attempt = job.attempts, "executing job");

        let outcome = executor.execute(&job.command).await;
        classify_outcome(&store, &mut job, outcome, config.backoff_base, config.max_retries_fallback).await;
    }

    info!("shutdown complete");
}

/// Step 4 of spec.md §4.3: success -> Completed; failure with the
/// budget exhausted -> DLQ; failure with budget remaining -> Failed,
/// then Pending, then sleep the backoff delay in this worker.
async fn classify_outcome(
    store: &Arc<dyn JobStore>,
    job: &mut Job,
    outcome: ExecutionOutcome,
    backoff_base: u32,
    max_retries_fallback: u32,
) {
    let job_id = job.id.clone();

    if outcome.is_success() {
        job.state = JobState::Completed;
        job.updated_at = queuectl_core::now_iso8601();
        if let Err(e) = store.update_job(job).await {
            warn!(job_id = %job_id, "failed to record completion: {e}");
        } else {
            info!(job_id = %job_id, "job completed");
        }
        return;
    }

    log_failure(&job_id, &outcome);

    let effective_max_retries = effective_max_retries(job, max_retries_fallback);

    if job.attempts >= effective_max_retries {
        info!(
            job_id = %job_id,
            attempts = job.attempts,
            max_retries = effective_max_retries,
            "retry budget exhausted, moving to DLQ"
        );
        if let Err(e) = store.move_to_dlq(job).await {
            warn!(job_id = %job_id, "failed to move job to DLQ: {e}");
        }
        return;
    }

    job.state = JobState::Failed;
    job.updated_at = queuectl_core::now_iso8601();
    if let Err(e) = store.update_job(job).await {
        warn!(job_id = %job_id, "failed to record failed attempt: {e}");
    }

    let delay = Duration::from_secs(backoff_base.pow(job.attempts) as u64);

    job.state = JobState::Pending;
    job.updated_at = queuectl_core::now_iso8601();
    if let Err(e) = store.update_job(job).await {
        warn!(job_id = %job_id, "failed to requeue job: {e}");
    }

    info!(
        job_id = %job_id,
        attempt = job.attempts,
        max_retries = effective_max_retries,
        delay_secs = delay.as_secs(),
        "retrying after backoff"
    );
    tokio::time::sleep(delay).await;
}

fn log_failure(job_id: &str, outcome: &ExecutionOutcome) {
    match outcome {
        ExecutionOutcome::Failure { exit_code } => {
            warn!(job_id, ?exit_code, "job failed");
        }
        ExecutionOutcome::Timeout => {
            warn!(job_id, "job timed out");
        }
        ExecutionOutcome::ExecutorError { message } => {
            warn!(job_id, message, "job could not be launched");
        }
        ExecutionOutcome::Success => unreachable!(),
    }
}

/// spec.md §4.3: "the worker reads `max_retries` from the job row if
/// positive, otherwise from current config." A job's `max_retries` is
/// normally baked in at enqueue time (`AddJob`), but a row can still end
/// up with a non-positive value (a hand-edited row, a future migration),
/// so the worker falls back to the live `config.json` value rather than
/// a hardcoded number, matching `worker.py`'s `job.max_retries if
/// job.max_retries > 0 else config_max_retries`.
fn effective_max_retries(job: &Job, max_retries_fallback: u32) -> u32 {
    if job.max_retries > 0 {
        job.max_retries
    } else {
        max_retries_fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use queuectl_core::Job;
    use std::sync::Mutex;

    struct FixedExecutor(Mutex<Vec<ExecutionOutcome>>);

    #[async_trait]
    impl Executor for FixedExecutor {
        async fn execute(&self, _command: &str) -> ExecutionOutcome {
            let mut queue = self.0.lock().unwrap();
            if queue.is_empty() {
                ExecutionOutcome::Success
            } else {
                queue.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn success_marks_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(
            queuectl_store_sqlite::SqliteJobStore::connect(dir.path().join("q.db"), 5)
                .await
                .unwrap(),
        );
        let job = Job::new(Some("ok".into()), "true".into(), 3);
        store.add_job(&job).await.unwrap();

        let executor: Arc<dyn Executor> = Arc::new(FixedExecutor(Mutex::new(vec![])));
        let config = WorkerConfig {
            backoff_base: 2,
            stale_processing_secs: 300,
            reap_interval: Duration::from_secs(60),
            max_retries_fallback: 3,
        };

        let mut claimed = store.claim_next_pending().await.unwrap().unwrap();
        claimed.attempts += 1;
        let outcome = executor.execute(&claimed.command).await;
        classify_outcome(&store, &mut claimed, outcome, config.backoff_base, config.max_retries_fallback).await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_moves_to_dlq() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(
            queuectl_store_sqlite::SqliteJobStore::connect(dir.path().join("q.db"), 5)
                .await
                .unwrap(),
        );
        let job = Job::new(Some("doomed".into()), "false".into(), 1);
        store.add_job(&job).await.unwrap();

        let mut claimed = store.claim_next_pending().await.unwrap().unwrap();
        claimed.attempts = 1;
        classify_outcome(
            &store,
            &mut claimed,
            ExecutionOutcome::Failure { exit_code: Some(1) },
            2,
            3,
        )
        .await;

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.dead, 1);
        let dlq_job = store.find_in_dlq("doomed").await.unwrap().unwrap();
        assert_eq!(dlq_job.attempts, 1);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(
            queuectl_store_sqlite::SqliteJobStore::connect(dir.path().join("q.db"), 5)
                .await
                .unwrap(),
        );
        let job = Job::new(Some("retry-me".into()), "false".into(), 3);
        store.add_job(&job).await.unwrap();

        let mut claimed = store.claim_next_pending().await.unwrap().unwrap();
        claimed.attempts = 1;
        // backoff_base = 1 so the test doesn't actually sleep.
        classify_outcome(
            &store,
            &mut claimed,
            ExecutionOutcome::Failure { exit_code: Some(1) },
            1,
            3,
        )
        .await;

        let pending = store.list_by_state(JobState::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].state, JobState::Pending);
    }

    #[test]
    fn effective_max_retries_falls_back_to_live_config_when_job_row_has_none() {
        let mut job = Job::new(Some("legacy".into()), "true".into(), 3);
        job.max_retries = 0;
        assert_eq!(effective_max_retries(&job, 5), 5);
    }

    #[test]
    fn effective_max_retries_prefers_the_jobs_own_snapshot() {
        let job = Job::new(Some("snapshotted".into()), "true".into(), 3);
        assert_eq!(effective_max_retries(&job, 99), 3);
    }
}
