//! Process-level management: spawn detached worker processes, persist
//! their PIDs, deliver graceful-shutdown signals, and report liveness
//! (spec.md §4.4).
//!
//! Grounded in `proerror77-ploy`'s `strategy.rs` daemon-control commands:
//! the same `Command::new(std::env::current_exe()?)` re-exec pattern for
//! `start`, the same `nix::sys::signal::kill` for `stop`, and the same
//! `SIGCONT`-probe trick for liveness.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// One entry reported by `Status`.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub pid: u32,
    pub state: WorkerState,
}

#[derive(Debug, Clone)]
pub enum WorkerState {
    /// `rss_bytes` is `sysinfo::Process::memory()`, already in bytes.
    Alive { cpu_percent: f32, rss_bytes: u64 },
    Stopped,
}

/// The hidden subcommand a spawned worker process re-invokes itself
/// with (SPEC_FULL.md §4.4/§6). Not listed in `--help`.
pub const WORKER_ENTRYPOINT_ARG: &str = "__worker-run";

pub struct Supervisor {
    pid_file: PathBuf,
    worker_log_dir: PathBuf,
    data_dir: PathBuf,
}

impl Supervisor {
    pub fn new(pid_file: PathBuf, worker_log_dir: PathBuf, data_dir: PathBuf) -> Self {
        Supervisor {
            pid_file,
            worker_log_dir,
            data_dir,
        }
    }

    /// Spawns `count` detached worker processes, each re-invoking the
    /// current executable with the hidden worker entrypoint and this
    /// process's data directory. The caller is responsible for dropping
    /// any open store handle before calling this (spec.md §4.4: workers
    /// must not inherit a shared in-progress transaction state).
    pub fn start(&self, count: u32) -> Result<Vec<u32>> {
        fs::create_dir_all(&self.worker_log_dir)
            .context("creating worker log directory")?;

        let exe = std::env::current_exe().context("resolving current executable")?;
        let mut pids = Vec::with_capacity(count as usize);

        for i in 0..count {
            // Named by spawn order, not PID: the PID isn't known until
            // after the file handle is already wired into the child.
            let log_path = self.worker_log_dir.join(format!("worker-{i}.log"));
            let log = fs::File::create(&log_path).context("creating worker log file")?;
            let log_err = log.try_clone().context("cloning worker log file handle")?;

            let mut cmd = std::process::Command::new(&exe);
            cmd.arg(WORKER_ENTRYPOINT_ARG)
                .arg("--data-dir")
                .arg(&self.data_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err));

            let child = cmd.spawn().context("spawning worker process")?;
            pids.push(child.id());

            // Detach: let the `Child` handle drop without waiting on it.
            // Dropping it only closes our end of its stdio pipes (which
            // are files, not pipes, here); it does not signal the child.
            drop(child);
        }

        self.write_pid_file(&pids)?;
        Ok(pids)
    }

    /// Sends `SIGTERM` to every PID in the PID file, then removes the
    /// file. Fire-and-forget: does not wait for workers to exit.
    pub fn stop(&self) -> Result<Vec<u32>> {
        let pids = self.read_pid_file()?;

        for &pid in &pids {
            send_signal(pid, Signal::Terminate);
        }

        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("removing PID file")?;
        }

        Ok(pids)
    }

    /// Probes every PID in the file for liveness, returning per-process
    /// resource usage for live processes. Prunes dead entries from the
    /// PID file as a side effect (spec.md §4.4).
    pub fn status(&self) -> Result<Vec<WorkerStatus>> {
        let pids = self.read_pid_file()?;
        if pids.is_empty() {
            return Ok(Vec::new());
        }

        let mut system = System::new();
        system.refresh_processes_specifics(ProcessRefreshKind::everything());

        let mut statuses = Vec::with_capacity(pids.len());
        let mut still_alive = Vec::new();

        for pid in pids {
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                statuses.push(WorkerStatus {
                    pid,
                    state: WorkerState::Alive {
                        cpu_percent: process.cpu_usage(),
                        rss_bytes: process.memory(),
                    },
                });
                still_alive.push(pid);
            } else {
                statuses.push(WorkerStatus {
                    pid,
                    state: WorkerState::Stopped,
                });
            }
        }

        self.write_pid_file(&still_alive)?;
        Ok(statuses)
    }

    fn read_pid_file(&self) -> Result<Vec<u32>> {
        if !self.pid_file.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.pid_file).context("reading PID file")?;
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    fn write_pid_file(&self, pids: &[u32]) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = pids.iter().map(|pid| format!("{pid}\n")).collect::<String>();
        fs::write(&self.pid_file, content).context("writing PID file")
    }
}

enum Signal {
    Terminate,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid as NixPid;

    let sig = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
    };

    if let Err(e) = kill(NixPid::from_raw(pid as i32), sig) {
        tracing::warn!("failed to signal worker {pid}: {e}");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) {
    tracing::warn!("signal delivery is not supported on this platform; PID {pid} was not stopped");
}

pub fn default_worker_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("worker-logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_with_no_pid_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            dir.path().join("workers.pid"),
            dir.path().join("worker-logs"),
            dir.path().to_path_buf(),
        );
        assert!(supervisor.stop().unwrap().is_empty());
    }

    #[test]
    fn status_with_no_pid_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            dir.path().join("workers.pid"),
            dir.path().join("worker-logs"),
            dir.path().to_path_buf(),
        );
        assert!(supervisor.status().unwrap().is_empty());
    }

    #[test]
    fn status_prunes_dead_pids_from_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("workers.pid");
        // PID 1 is conventionally init and will not match a fabricated
        // high PID that's very unlikely to be alive in a test sandbox.
        fs::write(&pid_file, "999999999\n").unwrap();
        let supervisor = Supervisor::new(pid_file.clone(), dir.path().join("worker-logs"), dir.path().to_path_buf());

        let statuses = supervisor.status().unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(matches!(statuses[0].state, WorkerState::Stopped));

        let remaining = fs::read_to_string(&pid_file).unwrap();
        assert!(remaining.trim().is_empty());
    }
}
