//! Supervised execution of external tools.
//!
//! Every child is registered under the job that spawned it, bounded by the
//! job's timeout, and killed when the daemon shuts down.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::ProcessTimeout;

/// Lines of stderr/stdout kept per stream (the tail)
pub const CAPTURE_LINES: usize = 200;

/// Result of a child that ran to completion
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    /// Tail of stderr, at most [`CAPTURE_LINES`] lines
    pub stderr: String,
    pub elapsed_secs: f64,
}

impl ProcessOutput {
    /// Diagnostic text used for classification: stderr, falling back to stdout
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} timed out after {secs}s and was killed")]
    TimedOut { program: String, secs: u64 },

    #[error("{program} killed by shutdown")]
    Shutdown { program: String },

    #[error("waiting on {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Tracks running children per job and broadcasts shutdown to them
#[derive(Debug)]
pub struct ProcessSupervisor {
    shutdown_tx: watch::Sender<bool>,
    running: Mutex<HashMap<String, Vec<u32>>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Ask every supervised child to die; later runs are refused
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Receiver that flips to `true` on shutdown
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Pids currently running for `job_id`
    pub fn running_for(&self, job_id: &str) -> Vec<u32> {
        self.lock_running().get(job_id).cloned().unwrap_or_default()
    }

    /// Number of live children across all jobs
    pub fn running_count(&self) -> usize {
        self.lock_running().values().map(Vec::len).sum()
    }

    /// Spawn `program` with `args` for `job_id` and wait for it, killing it
    /// on timeout or shutdown.
    pub async fn run(
        &self,
        job_id: &str,
        program: &Path,
        args: &[String],
        timeout: ProcessTimeout,
    ) -> Result<ProcessOutput, RunError> {
        let name = program.display().to_string();
        let mut shutdown_rx = self.subscribe();
        if *shutdown_rx.borrow() {
            return Err(RunError::Shutdown { program: name });
        }

        debug!("Job {}: executing {} {}", job_id, name, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: name.clone(),
            source,
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.register(job_id, pid);
        }

        let stdout_handle = child.stdout.take().map(|s| tokio::spawn(read_tail(s)));
        let stderr_handle = child.stderr.take().map(|s| tokio::spawn(read_tail(s)));

        let deadline = timeout.as_duration();
        let waited = tokio::select! {
            status = child.wait() => Ok(status),
            _ = sleep_or_forever(deadline) => Err(RunError::TimedOut {
                program: name.clone(),
                secs: deadline.map(|d| d.as_secs()).unwrap_or_default(),
            }),
            _ = wait_for_shutdown(&mut shutdown_rx) => Err(RunError::Shutdown { program: name.clone() }),
        };

        let result = match waited {
            Ok(Ok(status)) => {
                let stdout = collect(stdout_handle).await;
                let stderr = collect(stderr_handle).await;
                Ok(ProcessOutput {
                    exit_code: status.code(),
                    success: status.success(),
                    stdout,
                    stderr,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                })
            }
            Ok(Err(source)) => Err(RunError::Wait { program: name.clone(), source }),
            Err(reason) => {
                warn!("Job {}: {}, killing pid {:?}", job_id, reason, pid);
                if let Err(e) = child.kill().await {
                    warn!("Job {}: failed to kill {}: {}", job_id, name, e);
                }
                Err(reason)
            }
        };

        if let Some(pid) = pid {
            self.unregister(job_id, pid);
        }
        result
    }

    fn register(&self, job_id: &str, pid: u32) {
        self.lock_running().entry(job_id.to_string()).or_default().push(pid);
    }

    fn unregister(&self, job_id: &str, pid: u32) {
        let mut running = self.lock_running();
        if let Some(pids) = running.get_mut(job_id) {
            pids.retain(|p| *p != pid);
            if pids.is_empty() {
                running.remove(job_id);
            }
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u32>>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn sleep_or_forever(deadline: Option<std::time::Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can signal shutdown any more
            std::future::pending::<()>().await;
        }
    }
}

async fn read_tail<R: AsyncRead + Unpin>(stream: R) -> String {
    let mut tail = VecDeque::with_capacity(CAPTURE_LINES);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == CAPTURE_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

async fn collect(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    }
}
