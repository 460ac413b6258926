//! Handlers for each CLI subcommand. Each function maps directly onto
//! one of spec.md §6's table rows; all of them talk only to
//! `queuectl-core`/`queuectl-worker` types.

use std::sync::Arc;

use anyhow::{bail, Result};
use queuectl_core::{Config, DataDir, Job, JobState, JobStore};
use queuectl_store_sqlite::SqliteJobStore;
use queuectl_worker::Supervisor;

use crate::cli::{ConfigCommand, DlqCommand, WorkerCommand};

pub async fn open_store(data_dir: &DataDir, config: &Config) -> Result<SqliteJobStore> {
    let store = SqliteJobStore::connect(data_dir.database_path(), config.busy_timeout_secs).await?;
    Ok(store)
}

fn supervisor(data_dir: &DataDir) -> Supervisor {
    Supervisor::new(
        data_dir.pid_file_path(),
        data_dir.worker_log_dir(),
        data_dir.root().to_path_buf(),
    )
}

/// `enqueue '<json>'` (spec.md §6): JSON must contain `command`; `id`
/// is optional. Exit 1 on bad JSON or a duplicate id.
pub async fn enqueue(data_dir: &DataDir, config: &Config, job_spec: &str) -> Result<()> {
    let value: serde_json::Value = match serde_json::from_str(job_spec) {
        Ok(value) => value,
        Err(e) => bail!("Error: invalid JSON string ({e})"),
    };

    let command = match value.get("command").and_then(|v| v.as_str()) {
        Some(command) if !command.is_empty() => command.to_string(),
        _ => bail!("Error: 'command' field is required in JSON."),
    };

    let id = value.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());

    let job = Job::new(id, command, config.max_retries);
    let store = open_store(data_dir, config).await?;

    if store.add_job(&job).await? {
        println!("Successfully enqueued job {}", job.id);
        Ok(())
    } else {
        bail!("Failed to enqueue job {} (id may already exist).", job.id);
    }
}

/// `worker start --count N` / `worker stop`.
pub async fn worker(data_dir: &DataDir, action: &WorkerCommand) -> Result<()> {
    match action {
        WorkerCommand::Start { count } => {
            if *count < 1 {
                bail!("Error: count must be at least 1.");
            }
            // No store handle is held at this point in the CLI process,
            // so there's nothing to drop before spawning (spec.md §4.4).
            let pids = supervisor(data_dir).start(*count)?;
            println!("Started {} worker(s) with PIDs: {pids:?}", pids.len());
        }
        WorkerCommand::Stop => {
            let pids = supervisor(data_dir).stop()?;
            if pids.is_empty() {
                println!("No workers seem to be running.");
            } else {
                println!("Sent SIGTERM to PIDs: {pids:?}");
            }
        }
    }
    Ok(())
}

/// `status`: job state counts plus worker liveness.
pub async fn status(data_dir: &DataDir, config: &Config) -> Result<()> {
    let store = open_store(data_dir, config).await?;
    let stats = store.stats().await?;

    println!("--- Job Status Summary ---");
    for state in JobState::ALL {
        let mut label = state.as_str().to_string();
        if let Some(first) = label.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        println!("- {label}:\t{}", stats.get(state));
    }

    println!("\n--- Active Worker Status ---");
    let workers = supervisor(data_dir).status()?;
    if workers.is_empty() {
        println!("No active workers found.");
        return Ok(());
    }
    for worker in workers {
        match worker.state {
            queuectl_worker::WorkerState::Alive { cpu_percent, rss_bytes } => {
                println!(
                    "- PID: {}\tStatus: running\tCPU: {:.1}%\tRSS: {:.1}MB",
                    worker.pid,
                    cpu_percent,
                    rss_bytes as f64 / (1024.0 * 1024.0)
                );
            }
            queuectl_worker::WorkerState::Stopped => {
                println!("- PID: {}\tStatus: stopped", worker.pid);
            }
        }
    }
    Ok(())
}

/// `list --state S` (default PENDING; DEAD reads the DLQ).
pub async fn list_jobs(data_dir: &DataDir, config: &Config, state: &str) -> Result<()> {
    let state: JobState = state.parse().map_err(|e: String| anyhow::anyhow!("Error: {e}"))?;
    let store = open_store(data_dir, config).await?;
    let jobs = store.list_by_state(state).await?;

    if jobs.is_empty() {
        println!("No jobs found in state: {state}");
        return Ok(());
    }

    println!("--- Jobs in '{state}' state ---");
    print_jobs(&jobs)?;
    Ok(())
}

/// `dlq list` / `dlq retry <id>`.
pub async fn dlq(data_dir: &DataDir, config: &Config, action: &DlqCommand) -> Result<()> {
    let store = open_store(data_dir, config).await?;
    match action {
        DlqCommand::List => {
            let jobs = store.list_by_state(JobState::Dead).await?;
            if jobs.is_empty() {
                println!("Dead Letter Queue is empty.");
                return Ok(());
            }
            println!("--- Jobs in Dead Letter Queue ---");
            print_jobs(&jobs)?;
        }
        DlqCommand::Retry { id } => {
            let found = store.find_in_dlq(id).await?;
            if found.is_none() {
                bail!("Error: job {id} not found in DLQ.");
            }
            if store.retry_from_dlq(id).await? {
                println!("Job {id} has been re-queued as 'pending'.");
            } else {
                bail!("Error: failed to retry job {id}.");
            }
        }
    }
    Ok(())
}

/// `config show` / `config set K V`.
pub fn config(data_dir: &DataDir, action: &ConfigCommand) -> Result<()> {
    let path = data_dir.config_path();
    match action {
        ConfigCommand::Show => {
            let config = Config::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommand::Set { key, value } => {
            let mut config = Config::load(&path)?;
            config.set(key, value)?;
            config.save(&path)?;
            println!("Config updated: {key} = {value}");
        }
    }
    Ok(())
}

/// Runs a single worker's steady-state loop until it receives a
/// shutdown signal (spec.md §4.3/§4.4). This is what the hidden
/// `__worker-run` subcommand invokes.
pub async fn worker_run(data_dir: &DataDir, config: &Config) -> Result<()> {
    let store = Arc::new(open_store(data_dir, config).await?);
    let executor = Arc::new(queuectl_worker::ShellExecutor);
    let shutdown = queuectl_worker::ShutdownToken::new();

    install_signal_handlers(shutdown.clone());

    let worker_config = queuectl_worker::WorkerConfig {
        backoff_base: config.backoff_base,
        stale_processing_secs: config.stale_processing_secs,
        reap_interval: std::time::Duration::from_secs(60),
        max_retries_fallback: config.max_retries,
    };

    queuectl_worker::run_worker_loop(store as Arc<dyn JobStore>, executor, worker_config, shutdown).await;
    Ok(())
}

/// Installs handlers for both interrupt and termination signals. Per
/// spec.md §4.4, these only flip a boolean flag; all cleanup happens at
/// the top of the worker loop so an in-flight job is never preempted.
fn install_signal_handlers(shutdown: queuectl_worker::ShutdownToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    shutdown.request_shutdown();
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("shutdown signal received, finishing in-flight job before exit");
        shutdown.request_shutdown();
    });
}

fn print_jobs(jobs: &[Job]) -> Result<()> {
    for job in jobs {
        println!("{}", serde_json::to_string_pretty(job)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir(root: &std::path::Path) -> DataDir {
        DataDir::new(root.to_path_buf())
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = data_dir(dir.path());
        let config = Config::default();
        let err = enqueue(&data_dir, &config, "not json").await.unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = data_dir(dir.path());
        let config = Config::default();
        let err = enqueue(&data_dir, &config, r#"{"id":"j1"}"#).await.unwrap_err();
        assert!(err.to_string().contains("'command' field is required"));
    }

    #[tokio::test]
    async fn enqueue_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = data_dir(dir.path());
        let config = Config::default();
        enqueue(&data_dir, &config, r#"{"id":"j1","command":"true"}"#).await.unwrap();

        let store = open_store(&data_dir, &config).await.unwrap();
        let pending = store.list_by_state(JobState::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "j1");
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = data_dir(dir.path());
        let config = Config::default();
        enqueue(&data_dir, &config, r#"{"id":"dup","command":"true"}"#).await.unwrap();
        let err = enqueue(&data_dir, &config, r#"{"id":"dup","command":"true"}"#).await.unwrap_err();
        assert!(err.to_string().contains("already exist"));
    }

    #[tokio::test]
    async fn dlq_retry_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = data_dir(dir.path());
        let config = Config::default();
        let err = dlq(&data_dir, &config, &DlqCommand::Retry { id: "ghost".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found in DLQ"));
    }

    #[test]
    fn config_set_then_show_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = data_dir(dir.path());
        config(&data_dir, &ConfigCommand::Set { key: "max_retries".into(), value: "9".into() }).unwrap();
        let loaded = Config::load(&data_dir.config_path()).unwrap();
        assert_eq!(loaded.max_retries, 9);
    }
}
