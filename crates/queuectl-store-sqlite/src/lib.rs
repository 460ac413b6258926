//! SQLite implementation of the `queuectl` job queue.
//!
//! This crate provides the durable, transactional [`JobStore`]
//! implementation backing the `queuectl` CLI: a local `queue.db` file
//! with two tables, `jobs` (active) and `dlq` (terminal).
//!
//! # Features
//!
//! - The atomic claim (`BEGIN IMMEDIATE` + select-then-update + commit)
//!   that lets concurrent worker processes share one database file
//!   safely.
//! - Exponential-backoff-friendly retry bookkeeping (the backoff
//!   computation itself lives in `queuectl-worker`; this crate only
//!   persists state).
//! - A dead letter queue for jobs that exhaust their retry budget.
//! - A reaper sweep for `Processing` rows abandoned by a crashed worker.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL,
//!     attempts INTEGER NOT NULL,
//!     max_retries INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE dlq (LIKE jobs);
//! CREATE INDEX idx_jobs_state_created_at ON jobs (state, created_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl_store_sqlite::SqliteJobStore;
//!
//! let store = SqliteJobStore::connect("./data/queue.db", 10).await?;
//! let claimed = store.claim_next_pending().await?;
//! ```

use async_trait::async_trait;
use queuectl_core::error::{QueueError, Result};
use queuectl_core::job::{Job, JobState};
use queuectl_core::store::{JobStore, QueueStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// A SQLite-backed [`JobStore`].
///
/// Holds a single-connection pool: SQLite only ever has one real writer
/// at a time, so a pool of size one plus a configured busy-timeout gives
/// us the same "wait, then give up" semantics spec.md §4.1 asks for,
/// without a hand-rolled thread-local connection cache.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Opens (creating if necessary) the database at `path` and ensures
    /// the schema exists.
    pub async fn connect(path: impl AsRef<Path>, busy_timeout_secs: u64) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
            .map_err(sqlx_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(sqlx_err)?;

        let store = SqliteJobStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for table in ["jobs", "dlq"] {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    command TEXT NOT NULL,
                    state TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            );
            sqlx::query(&sql).execute(&self.pool).await.map_err(sqlx_err)?;
        }
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_created_at ON jobs (state, created_at)")
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn sqlx_err(e: sqlx::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<Job, sqlx::Error> {
    let state_str: String = row.try_get("state")?;
    let state = state_str
        .parse::<JobState>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;
    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn add_job(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_retries as i64)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(sqlx_err(e)),
        }
    }

    /// The atomic claim. A `BEGIN IMMEDIATE` transaction serialises
    /// concurrent workers at the SQLite level (spec.md §4.1 step 1); any
    /// error here, including lock contention, is swallowed and reported
    /// as "no job available" rather than propagated (step 4's failure
    /// semantics), since the worker's own polling loop will retry.
    async fn claim_next_pending(&self) -> Result<Option<Job>> {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("claim_next_pending: could not acquire a connection: {e}");
                return Ok(None);
            }
        };

        if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            debug!("claim_next_pending: could not begin immediate transaction: {e}");
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT id, command, state, attempts, max_retries, created_at, updated_at
             FROM jobs WHERE state = 'pending' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("claim_next_pending: select failed: {e}");
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Ok(None);
            }
        };

        let Some(row) = row else {
            let _ = sqlx::query("COMMIT").execute(&mut *conn).await;
            return Ok(None);
        };

        let mut job = match job_from_row(&row) {
            Ok(job) => job,
            Err(e) => {
                warn!("claim_next_pending: decoding row failed: {e}");
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Ok(None);
            }
        };

        job.state = JobState::Processing;
        job.updated_at = queuectl_core::now_iso8601();

        let update = sqlx::query("UPDATE jobs SET state = ?, updated_at = ? WHERE id = ?")
            .bind(job.state.as_str())
            .bind(&job.updated_at)
            .bind(&job.id)
            .execute(&mut *conn)
            .await;

        if let Err(e) = update {
            warn!("claim_next_pending: update failed: {e}");
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Ok(None);
        }

        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            warn!("claim_next_pending: commit failed: {e}");
            return Ok(None);
        }

        Ok(Some(job))
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = ?, attempts = ?, updated_at = ? WHERE id = ?")
            .bind(job.state.as_str())
            .bind(job.attempts as i64)
            .bind(&job.updated_at)
            .bind(&job.id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn move_to_dlq(&self, job: &Job) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let updated_at = queuectl_core::now_iso8601();

        sqlx::query(
            "INSERT INTO dlq (id, command, state, attempts, max_retries, created_at, updated_at)
             VALUES (?, ?, 'dead', ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.attempts as i64)
        .bind(job.max_retries as i64)
        .bind(&job.created_at)
        .bind(&updated_at)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(&job.id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;
        Ok(())
    }

    async fn retry_from_dlq(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let row = sqlx::query(
            "SELECT id, command, state, attempts, max_retries, created_at, updated_at
             FROM dlq WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(sqlx_err)?;
            return Ok(false);
        };
        let job = job_from_row(&row).map_err(sqlx_err)?;
        let now = queuectl_core::now_iso8601();

        let insert = sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
             VALUES (?, ?, 'pending', 0, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.max_retries as i64)
        .bind(&job.created_at)
        .bind(&now)
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.map_err(sqlx_err)?;
                return Err(QueueError::Conflict(format!(
                    "job {id} already exists in the active queue"
                )));
            }
            Err(e) => return Err(sqlx_err(e)),
        }

        sqlx::query("DELETE FROM dlq WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;
        Ok(true)
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let table = if state == JobState::Dead { "dlq" } else { "jobs" };
        let sql = format!(
            "SELECT id, command, state, attempts, max_retries, created_at, updated_at
             FROM {table} WHERE state = ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;

        rows.iter().map(|row| job_from_row(row).map_err(sqlx_err)).collect()
    }

    async fn find_in_dlq(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, command, state, attempts, max_retries, created_at, updated_at
             FROM dlq WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;

        row.as_ref().map(job_from_row).transpose().map_err(sqlx_err)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let rows = sqlx::query("SELECT state, COUNT(*) as count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;

        for row in rows {
            let state: String = row.try_get("state").map_err(sqlx_err)?;
            let count: i64 = row.try_get("count").map_err(sqlx_err)?;
            match state.as_str() {
                "pending" => stats.pending = count as u64,
                "processing" => stats.processing = count as u64,
                "completed" => stats.completed = count as u64,
                "failed" => stats.failed = count as u64,
                _ => {}
            }
        }

        let dead: i64 = sqlx::query("SELECT COUNT(*) as count FROM dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)?
            .try_get("count")
            .map_err(sqlx_err)?;
        stats.dead = dead as u64;

        Ok(stats)
    }

    /// Returns abandoned `Processing` rows to `Pending`, or — if the
    /// reclaim would itself exhaust the retry budget — straight to the
    /// DLQ, via the same `attempts + 1 >= max_retries` predicate
    /// `classify_outcome` applies to every ordinary failure (spec.md
    /// §8 property 3: a `Completed`/`Dead` job's `attempts` must never
    /// exceed/must exactly equal `max_retries`). A single bulk `UPDATE`
    /// can't express that branch, so each stale row is read and then
    /// routed individually; the guard clause on every write (`state =
    /// 'processing' AND updated_at = ?`, the row's own pre-reap
    /// timestamp) makes each row's transition a no-op if another worker
    /// already reaped it first, rather than double-reaping it.
    /// Grounded in `seesaw-job-postgres`'s `reclaim_expired`, generalized
    /// with the DLQ-promotion branch that reclaim has no equivalent of
    /// (it only resets `status`/`lease_expires_at`, never an
    /// attempts-equivalent counter).
    async fn reap_stale(&self, stale_after_secs: u64) -> Result<u64> {
        let threshold = chrono::Utc::now() - chrono::Duration::seconds(stale_after_secs as i64);
        let threshold = threshold.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let rows = sqlx::query(
            "SELECT id, command, state, attempts, max_retries, created_at, updated_at
             FROM jobs WHERE state = 'processing' AND updated_at < ?",
        )
        .bind(&threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        let mut reaped = 0u64;
        for row in &rows {
            let job = job_from_row(row).map_err(sqlx_err)?;
            if self.reclaim_one_stale_job(&job).await? {
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}

impl SqliteJobStore {
    /// Reclaims a single abandoned `Processing` row, guarded by its own
    /// pre-reap `updated_at` so a concurrent reaper sweep (this worker's
    /// next interval, or another worker's) can't double-reclaim it.
    /// Returns `true` if this call performed the reclaim.
    async fn reclaim_one_stale_job(&self, job: &Job) -> Result<bool> {
        let bumped_attempts = job.attempts + 1;
        let effective_max_retries = if job.max_retries > 0 { job.max_retries } else { 1 };
        let now = queuectl_core::now_iso8601();

        if bumped_attempts >= effective_max_retries {
            let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

            let deleted = sqlx::query(
                "DELETE FROM jobs WHERE id = ? AND state = 'processing' AND updated_at = ?",
            )
            .bind(&job.id)
            .bind(&job.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

            if deleted.rows_affected() == 0 {
                tx.rollback().await.map_err(sqlx_err)?;
                return Ok(false);
            }

            sqlx::query(
                "INSERT INTO dlq (id, command, state, attempts, max_retries, created_at, updated_at)
                 VALUES (?, ?, 'dead', ?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(&job.command)
            .bind(bumped_attempts as i64)
            .bind(job.max_retries as i64)
            .bind(&job.created_at)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

            tx.commit().await.map_err(sqlx_err)?;
            warn!(job_id = %job.id, attempts = bumped_attempts, "reaper: stale job exhausted its retry budget, moved to DLQ");
            Ok(true)
        } else {
            let updated = sqlx::query(
                "UPDATE jobs SET state = 'pending', attempts = ?, updated_at = ?
                 WHERE id = ? AND state = 'processing' AND updated_at = ?",
            )
            .bind(bumped_attempts as i64)
            .bind(&now)
            .bind(&job.id)
            .bind(&job.updated_at)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;

            Ok(updated.rows_affected() > 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::Job;

    async fn open_store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let store = SqliteJobStore::connect(&path, 10).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn add_then_claim_transitions_to_processing() {
        let (_dir, store) = open_store().await;
        let job = Job::new(Some("j1".into()), "true".into(), 3);
        assert!(store.add_job(&job).await.unwrap());

        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, "j1");
        assert_eq!(claimed.state, JobState::Processing);

        assert!(store.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (_dir, store) = open_store().await;
        let job = Job::new(Some("dup".into()), "true".into(), 3);
        assert!(store.add_job(&job).await.unwrap());
        assert!(!store.add_job(&job).await.unwrap());
    }

    #[tokio::test]
    async fn claim_orders_oldest_created_at_first() {
        let (_dir, store) = open_store().await;
        let mut older = Job::new(Some("older".into()), "true".into(), 3);
        older.created_at = "2020-01-01T00:00:00Z".into();
        older.updated_at = older.created_at.clone();
        let mut newer = Job::new(Some("newer".into()), "true".into(), 3);
        newer.created_at = "2024-01-01T00:00:00Z".into();
        newer.updated_at = newer.created_at.clone();

        store.add_job(&newer).await.unwrap();
        store.add_job(&older).await.unwrap();

        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, "older");
    }

    #[tokio::test]
    async fn move_to_dlq_then_retry_round_trips() {
        let (_dir, store) = open_store().await;
        let mut job = Job::new(Some("doomed".into()), "false".into(), 1);
        store.add_job(&job).await.unwrap();
        job.attempts = 1;
        store.move_to_dlq(&job).await.unwrap();

        assert!(store.list_by_state(JobState::Pending).await.unwrap().is_empty());
        let dlq_job = store.find_in_dlq("doomed").await.unwrap().unwrap();
        assert_eq!(dlq_job.state, JobState::Dead);
        assert_eq!(dlq_job.attempts, 1);

        assert!(store.retry_from_dlq("doomed").await.unwrap());
        assert!(store.find_in_dlq("doomed").await.unwrap().is_none());
        let active = store.list_by_state(JobState::Pending).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].attempts, 0);
        assert_eq!(active[0].state, JobState::Pending);
    }

    #[tokio::test]
    async fn retry_from_dlq_unknown_id_returns_false() {
        let (_dir, store) = open_store().await;
        assert!(!store.retry_from_dlq("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn retry_from_dlq_conflicting_active_id_errors() {
        let (_dir, store) = open_store().await;
        let mut job = Job::new(Some("conflict".into()), "false".into(), 1);
        store.add_job(&job).await.unwrap();
        job.attempts = 1;
        store.move_to_dlq(&job).await.unwrap();

        // Re-create an active job with the same id before retrying.
        let resurrected = Job::new(Some("conflict".into()), "true".into(), 3);
        store.add_job(&resurrected).await.unwrap();

        let err = store.retry_from_dlq("conflict").await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));
    }

    #[tokio::test]
    async fn stats_counts_every_state() {
        let (_dir, store) = open_store().await;
        store.add_job(&Job::new(Some("a".into()), "true".into(), 3)).await.unwrap();
        store.add_job(&Job::new(Some("b".into()), "true".into(), 3)).await.unwrap();
        store.claim_next_pending().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.dead, 0);
    }

    #[tokio::test]
    async fn reap_stale_returns_abandoned_processing_rows() {
        let (_dir, store) = open_store().await;
        let job = Job::new(Some("stuck".into()), "sleep 100".into(), 3);
        store.add_job(&job).await.unwrap();
        let mut claimed = store.claim_next_pending().await.unwrap().unwrap();
        claimed.updated_at = "2000-01-01T00:00:00Z".into();
        store.update_job(&claimed).await.unwrap();

        let reaped = store.reap_stale(300).await.unwrap();
        assert_eq!(reaped, 1);

        let pending = store.list_by_state(JobState::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn reap_stale_leaves_fresh_processing_rows_alone() {
        let (_dir, store) = open_store().await;
        let job = Job::new(Some("fresh".into()), "sleep 100".into(), 3);
        store.add_job(&job).await.unwrap();
        store.claim_next_pending().await.unwrap();

        let reaped = store.reap_stale(300).await.unwrap();
        assert_eq!(reaped, 0);
    }

    /// A stale row one attempt short of its budget must be promoted to
    /// the DLQ by the reaper, not bounced back to `pending` for an extra,
    /// unbudgeted attempt (spec.md §8 property 3).
    #[tokio::test]
    async fn reap_stale_promotes_exhausted_retries_to_dlq_instead_of_pending() {
        let (_dir, store) = open_store().await;
        let job = Job::new(Some("almost-doomed".into()), "false".into(), 3);
        store.add_job(&job).await.unwrap();

        let mut claimed = store.claim_next_pending().await.unwrap().unwrap();
        claimed.attempts = 2;
        claimed.updated_at = "2000-01-01T00:00:00Z".into();
        store.update_job(&claimed).await.unwrap();

        let reaped = store.reap_stale(300).await.unwrap();
        assert_eq!(reaped, 1);

        assert!(store.list_by_state(JobState::Pending).await.unwrap().is_empty());
        assert!(store.list_by_state(JobState::Processing).await.unwrap().is_empty());

        let dlq_job = store.find_in_dlq("almost-doomed").await.unwrap().unwrap();
        assert_eq!(dlq_job.state, JobState::Dead);
        assert_eq!(dlq_job.attempts, 3);
    }

    /// A second sweep over a row already reclaimed by a first sweep must
    /// be a no-op: the guard on `updated_at` means the row's pre-reap
    /// timestamp no longer matches once it's been reclaimed once.
    #[tokio::test]
    async fn reap_stale_does_not_double_reclaim_the_same_row() {
        let (_dir, store) = open_store().await;
        let job = Job::new(Some("stuck".into()), "sleep 100".into(), 3);
        store.add_job(&job).await.unwrap();
        let mut claimed = store.claim_next_pending().await.unwrap().unwrap();
        claimed.updated_at = "2000-01-01T00:00:00Z".into();
        store.update_job(&claimed).await.unwrap();

        assert_eq!(store.reap_stale(300).await.unwrap(), 1);
        assert_eq!(store.reap_stale(300).await.unwrap(), 0);

        let pending = store.list_by_state(JobState::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
    }
}
