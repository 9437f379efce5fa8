//! Worker lifecycle management.
//!
//! Spawns worker processes, tracks them in an in-memory map, classifies
//! their output, polls them for readiness, and tears them down. Each map
//! entry exclusively owns its `tokio::process::Child` and log buffers;
//! external callers only ever get snapshots and copied log slices.

pub mod args;
pub mod logs;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::platform::{KillMode, PlatformProbe};
use crate::runtime::RuntimeLocator;
use crate::store::Store;
use crate::types::{now_ts, CoreError, WorkerStatus};

pub use args::WorkerOptions;
pub use logs::{classify, LogClass};

const MAX_LOG_LINES: usize = 1000;
const MAX_CLASSIFIED_LINES: usize = 200;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Readiness, startup-poll, and per-request HTTP deadlines.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimeouts {
    pub startup: Duration,
    pub check_interval: Duration,
    pub api: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_millis(120_000),
            check_interval: Duration::from_millis(3_000),
            api: Duration::from_millis(5_000),
        }
    }
}

/// How worker processes are started.
///
/// `Script` is the real thing: resolve an interpreter through the runtime
/// locator and run `main.py` from the install directory. `Command` runs a
/// given program directly and exists so tests can substitute a mock worker
/// binary.
#[derive(Debug, Clone)]
pub enum Entrypoint {
    Script,
    Command(PathBuf),
}

/// Per-line observer for a worker's output streams.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of a readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyReport {
    pub ready: bool,
    pub status: WorkerStatus,
}

/// Copied view of a worker's runtime state.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub device_selector: String,
    pub start_time: Option<i64>,
    pub last_error: Option<String>,
}

struct ManagedWorker {
    id: Uuid,
    name: String,
    host: String,
    port: u16,
    status: WorkerStatus,
    pid: Option<u32>,
    device_selector: String,
    start_time: Option<i64>,
    last_error: Option<String>,
    child: Option<tokio::process::Child>,
    logs: VecDeque<String>,
    warnings: VecDeque<String>,
    errors: VecDeque<String>,
}

impl ManagedWorker {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            status: self.status,
            pid: self.pid,
            device_selector: self.device_selector.clone(),
            start_time: self.start_time,
            last_error: self.last_error.clone(),
        }
    }
}

pub struct WorkerManager {
    store: Arc<Store>,
    probe: Arc<dyn PlatformProbe>,
    locator: Arc<RuntimeLocator>,
    workers: DashMap<Uuid, Arc<Mutex<ManagedWorker>>>,
    client: reqwest::Client,
    timeouts: WorkerTimeouts,
    install_path: PathBuf,
    entrypoint: Entrypoint,
}

impl WorkerManager {
    pub fn new(
        store: Arc<Store>,
        probe: Arc<dyn PlatformProbe>,
        locator: Arc<RuntimeLocator>,
        install_path: PathBuf,
        timeouts: WorkerTimeouts,
    ) -> Self {
        Self::with_entrypoint(
            store,
            probe,
            locator,
            install_path,
            timeouts,
            Entrypoint::Script,
        )
    }

    /// Build a manager that launches a specific program instead of the
    /// install's `main.py`. Used by tests with the mock worker binary.
    pub fn with_entrypoint(
        store: Arc<Store>,
        probe: Arc<dyn PlatformProbe>,
        locator: Arc<RuntimeLocator>,
        install_path: PathBuf,
        timeouts: WorkerTimeouts,
        entrypoint: Entrypoint,
    ) -> Self {
        Self {
            store,
            probe,
            locator,
            workers: DashMap::new(),
            client: reqwest::Client::new(),
            timeouts,
            install_path,
            entrypoint,
        }
    }

    /// Spawn the worker process for a stored worker record and start
    /// tracking it.
    ///
    /// The record moves to `starting`; `ready` flips it to `running` after
    /// the first successful API probe. A fresh launch on a worker in
    /// `error` resets the record.
    pub async fn launch(
        &self,
        worker_id: Uuid,
        mut options: WorkerOptions,
        on_stdout: Option<LineCallback>,
        on_stderr: Option<LineCallback>,
    ) -> Result<WorkerSnapshot, CoreError> {
        let row = self
            .store
            .get_worker(worker_id)?
            .ok_or(CoreError::WorkerNotFound(worker_id))?;

        if let Some(existing) = self.workers.get(&worker_id) {
            let guard = existing.lock().await;
            let live = guard
                .pid
                .map(|pid| guard.child.is_some() && self.probe.process_alive(pid))
                .unwrap_or(false);
            if live {
                return Err(CoreError::InvalidState {
                    op: "launch",
                    status: guard.status.to_string(),
                });
            }
        }

        if options.port.is_none() {
            options.port = Some(row.port);
        }
        let port = options.port.unwrap_or(row.port);
        let device_selector = options.device_selector();

        let mut cmd = match &self.entrypoint {
            Entrypoint::Script => {
                let runtime = match self.locator.locate(&self.install_path).await {
                    Ok(path) => path,
                    Err(e) => {
                        self.store.update_worker_status(
                            worker_id,
                            WorkerStatus::Error,
                            None,
                            Some(&e.to_string()),
                        )?;
                        return Err(e);
                    }
                };
                let mut cmd = tokio::process::Command::new(runtime);
                cmd.arg("main.py");
                cmd
            }
            Entrypoint::Command(program) => tokio::process::Command::new(program),
        };
        cmd.args(options.to_args())
            .current_dir(&self.install_path)
            .envs(options.device_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(worker = %worker_id, name = %row.name, port, device = %device_selector, "Launching worker process");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                self.store.update_worker_status(
                    worker_id,
                    WorkerStatus::Error,
                    None,
                    Some(&reason),
                )?;
                return Err(CoreError::SpawnFailure { reason });
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let entry = Arc::new(Mutex::new(ManagedWorker {
            id: worker_id,
            name: row.name.clone(),
            host: row.host.clone(),
            port,
            status: WorkerStatus::Starting,
            pid,
            device_selector: device_selector.clone(),
            start_time: Some(now_ts()),
            last_error: None,
            child: Some(child),
            logs: VecDeque::new(),
            warnings: VecDeque::new(),
            errors: VecDeque::new(),
        }));
        self.workers.insert(worker_id, entry.clone());

        if let Some(stdout) = stdout {
            spawn_line_reader(entry.clone(), stdout, "stdout", on_stdout);
        }
        if let Some(stderr) = stderr {
            spawn_line_reader(entry.clone(), stderr, "stderr", on_stderr);
        }
        spawn_exit_watcher(entry.clone(), self.store.clone());

        self.store
            .update_worker_status(worker_id, WorkerStatus::Starting, pid, None)?;
        self.store
            .set_worker_device_selector(worker_id, &device_selector)?;
        if port != row.port {
            // The scheduler submits to the stored port; keep it current when
            // the launch options override it.
            self.store.set_worker_port(worker_id, port)?;
        }

        let snapshot = entry.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Poll a starting worker until its HTTP API answers.
    ///
    /// Defaults derive from the configured timeouts: one attempt per check
    /// interval until the startup timeout elapses. Returns early when the
    /// process dies or a fatal log pattern appears.
    pub async fn ready(
        &self,
        worker_id: Uuid,
        attempts: Option<u32>,
        interval: Option<Duration>,
    ) -> Result<ReadyReport, CoreError> {
        let entry = self.entry(worker_id)?;

        let interval = interval.unwrap_or(self.timeouts.check_interval);
        let attempts = attempts.unwrap_or_else(|| {
            (self.timeouts.startup.as_millis() as u64)
                .div_ceil(interval.as_millis().max(1) as u64)
                .max(1) as u32
        });

        for attempt in 0..attempts {
            let (status, pid, host, port) = {
                let guard = entry.lock().await;
                (guard.status, guard.pid, guard.host.clone(), guard.port)
            };

            if matches!(status, WorkerStatus::Stopped | WorkerStatus::Error) {
                return Ok(ReadyReport {
                    ready: false,
                    status,
                });
            }

            if let Some(pid) = pid {
                if !self.probe.process_alive(pid) {
                    let reason = "Process not running";
                    self.mark_error(&entry, reason).await?;
                    return Ok(ReadyReport {
                        ready: false,
                        status: WorkerStatus::Error,
                    });
                }
            }

            if self.probe_api(&host, port).await {
                {
                    let mut guard = entry.lock().await;
                    guard.status = WorkerStatus::Running;
                }
                self.store
                    .update_worker_status(worker_id, WorkerStatus::Running, pid, None)?;
                info!(worker = %worker_id, port, "Worker is ready");
                return Ok(ReadyReport {
                    ready: true,
                    status: WorkerStatus::Running,
                });
            }

            let fatal = {
                let guard = entry.lock().await;
                guard.errors.iter().find(|l| logs::is_fatal(l)).cloned()
            };
            if let Some(line) = fatal {
                warn!(worker = %worker_id, line = %line, "Fatal log detected during startup");
                self.mark_error(&entry, &line).await?;
                return Ok(ReadyReport {
                    ready: false,
                    status: WorkerStatus::Error,
                });
            }

            debug!(worker = %worker_id, attempt, "Worker not ready yet");
            tokio::time::sleep(interval).await;
        }

        // Attempts exhausted: a live child is just slow, a dead one is gone.
        let pid = entry.lock().await.pid;
        let alive = pid.map(|p| self.probe.process_alive(p)).unwrap_or(false);
        if alive {
            Ok(ReadyReport {
                ready: false,
                status: WorkerStatus::Starting,
            })
        } else {
            self.mark_error(&entry, "Process not running").await?;
            Ok(ReadyReport {
                ready: false,
                status: WorkerStatus::Error,
            })
        }
    }

    /// Terminate a worker's process and release its handle.
    ///
    /// Returns true iff the OS confirms the process is gone afterwards.
    pub async fn stop(&self, worker_id: Uuid) -> Result<bool, CoreError> {
        let entry = self.entry(worker_id)?;

        let pid = {
            let guard = entry.lock().await;
            match guard.pid {
                Some(pid) => pid,
                None => {
                    return Err(CoreError::InvalidState {
                        op: "stop",
                        status: guard.status.to_string(),
                    })
                }
            }
        };

        info!(worker = %worker_id, pid, "Stopping worker");
        let confirmed = self.probe.kill_process(pid, KillMode::Graceful).await;
        if !confirmed {
            debug!(worker = %worker_id, pid, "Kill not yet confirmed, reaping tracked handle");
        }

        {
            let mut guard = entry.lock().await;
            if let Some(child) = guard.child.as_mut() {
                // The tracked handle gets a direct kill as well, in case the
                // pid-based signal raced a reparented tree; waiting also
                // reaps the zombie so the liveness check below is accurate.
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            guard.child = None;
            guard.pid = None;
            guard.status = WorkerStatus::Stopped;
        }
        self.store
            .update_worker_status(worker_id, WorkerStatus::Stopped, None, None)?;

        Ok(!self.probe.process_alive(pid))
    }

    pub async fn get(&self, worker_id: Uuid) -> Option<WorkerSnapshot> {
        let entry = self.workers.get(&worker_id)?.clone();
        let guard = entry.lock().await;
        Some(guard.snapshot())
    }

    pub async fn get_all(&self) -> Vec<WorkerSnapshot> {
        let entries: Vec<_> = self.workers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.snapshot());
        }
        out
    }

    /// The newest `limit` log lines (all of them when `limit` is `None`).
    pub async fn logs(
        &self,
        worker_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<String>, CoreError> {
        let entry = self.entry(worker_id)?;
        let guard = entry.lock().await;
        Ok(tail(&guard.logs, limit))
    }

    pub async fn errors(&self, worker_id: Uuid) -> Result<Vec<String>, CoreError> {
        let entry = self.entry(worker_id)?;
        let guard = entry.lock().await;
        Ok(tail(&guard.errors, None))
    }

    pub async fn warnings(&self, worker_id: Uuid) -> Result<Vec<String>, CoreError> {
        let entry = self.entry(worker_id)?;
        let guard = entry.lock().await;
        Ok(tail(&guard.warnings, None))
    }

    fn entry(&self, worker_id: Uuid) -> Result<Arc<Mutex<ManagedWorker>>, CoreError> {
        self.workers
            .get(&worker_id)
            .map(|e| e.clone())
            .ok_or(CoreError::WorkerNotFound(worker_id))
    }

    /// GET each readiness endpoint; any 2xx means the worker is up.
    async fn probe_api(&self, host: &str, port: u16) -> bool {
        for path in ["/system_stats", "/prompt", "/"] {
            let url = format!("http://{host}:{port}{path}");
            let response = self
                .client
                .get(&url)
                .timeout(self.timeouts.api)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url, "Readiness probe succeeded");
                    return true;
                }
                Ok(resp) => {
                    debug!(url, status = %resp.status(), "Readiness probe refused");
                }
                Err(e) => {
                    debug!(url, error = %e, "Readiness probe failed");
                }
            }
        }
        false
    }

    async fn mark_error(
        &self,
        entry: &Arc<Mutex<ManagedWorker>>,
        reason: &str,
    ) -> Result<(), CoreError> {
        let id = {
            let mut guard = entry.lock().await;
            guard.status = WorkerStatus::Error;
            guard.last_error = Some(reason.to_string());
            guard.id
        };
        self.store
            .update_worker_status(id, WorkerStatus::Error, None, Some(reason))
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        // Kill remaining children so dropping the manager (tests, shutdown
        // paths) cannot leak worker processes.
        for entry in self.workers.iter() {
            if let Ok(mut guard) = entry.value().try_lock() {
                if let Some(child) = guard.child.as_mut() {
                    let _ = child.start_kill();
                }
            }
        }
    }
}

/// Copy out the newest `limit` lines of a buffer.
fn tail(buffer: &VecDeque<String>, limit: Option<usize>) -> Vec<String> {
    let skip = limit
        .map(|l| buffer.len().saturating_sub(l))
        .unwrap_or(0);
    buffer.iter().skip(skip).cloned().collect()
}

fn push_capped(buffer: &mut VecDeque<String>, line: &str, cap: usize) {
    if buffer.len() == cap {
        buffer.pop_front();
    }
    buffer.push_back(line.to_string());
}

/// Read a child pipe line by line, classify, buffer, and re-emit.
fn spawn_line_reader(
    entry: Arc<Mutex<ManagedWorker>>,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream: &'static str,
    callback: Option<LineCallback>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(raw)) = lines.next_line().await {
            let line = logs::strip_ansi(raw.trim_end());
            if line.is_empty() {
                continue;
            }
            let class = logs::classify(&line);
            {
                let mut guard = entry.lock().await;
                push_capped(&mut guard.logs, &line, MAX_LOG_LINES);
                match class {
                    LogClass::Warning => {
                        push_capped(&mut guard.warnings, &line, MAX_CLASSIFIED_LINES)
                    }
                    LogClass::Error => push_capped(&mut guard.errors, &line, MAX_CLASSIFIED_LINES),
                    LogClass::Ready => {
                        debug!(worker = %guard.id, stream, "Worker announced readiness in its logs")
                    }
                    _ => {}
                }
            }
            debug!(target: "worker", stream, "{}", line);
            if let Some(cb) = &callback {
                cb(&line);
            }
        }
    });
}

/// Watch for process exit and persist the resulting status transition:
/// nonzero exit code means `error`, a clean exit or signal means `stopped`.
fn spawn_exit_watcher(entry: Arc<Mutex<ManagedWorker>>, store: Arc<Store>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            let mut guard = entry.lock().await;
            let Some(child) = guard.child.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(Some(exit)) => {
                    let id = guard.id;
                    // Only transition workers that were considered live;
                    // stop() and the readiness poll own the other paths.
                    if matches!(guard.status, WorkerStatus::Starting | WorkerStatus::Running) {
                        let (status, reason) = match exit.code() {
                            Some(0) | None => (WorkerStatus::Stopped, None),
                            Some(code) => (
                                WorkerStatus::Error,
                                Some(format!("Process exited with code {code}")),
                            ),
                        };
                        warn!(worker = %id, exit = %exit, new_status = %status, "Worker process exited");
                        guard.status = status;
                        guard.last_error = reason.clone();
                        guard.child = None;
                        guard.pid = None;
                        drop(guard);
                        if let Err(e) =
                            store.update_worker_status(id, status, None, reason.as_deref())
                        {
                            warn!(worker = %id, error = %e, "Failed to persist exit status");
                        }
                    } else {
                        guard.child = None;
                        guard.pid = None;
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = %guard.id, error = %e, "Failed to poll worker process");
                    return;
                }
            }
        }
    });
}
