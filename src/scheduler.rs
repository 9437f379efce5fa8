//! Pairing pending jobs with idle workers.
//!
//! The queue lives in the store; the scheduler is the stateless pump that
//! drains it. A dispatch pass runs inside a scheduler-wide async mutex so
//! two concurrent passes can never bind the same job or the same idle
//! worker, and the store's guarded updates catch anything that still races.
//! Dispatch is a plain loop: after each terminal submit it goes around again
//! until it runs out of idle workers or pending jobs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{JobRow, Store, WorkerRow};
use crate::types::{CoreError, JobStatus, WorkerStatus};

const PENDING_SCAN_LIMIT: usize = 100;

pub struct Scheduler {
    store: Arc<Store>,
    client: reqwest::Client,
    api_timeout: Duration,
    dispatch_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, api_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            client: reqwest::Client::new(),
            api_timeout,
            dispatch_lock: Mutex::new(()),
        })
    }

    /// Create a `pending` job. Without a target worker the queue is pumped
    /// immediately; with one, the job waits until that worker is idle.
    pub async fn enqueue(
        &self,
        workflow_data: JsonValue,
        priority: i64,
        worker_id: Option<Uuid>,
    ) -> Result<JobRow, CoreError> {
        if let Some(worker_id) = worker_id {
            self.store
                .get_worker(worker_id)?
                .ok_or(CoreError::WorkerNotFound(worker_id))?;
        }
        let job = self.store.create_job(&workflow_data, priority, worker_id)?;
        info!(job = %job.id, priority, pinned = worker_id.is_some(), "Job enqueued");
        if worker_id.is_none() {
            self.try_dispatch().await?;
        }
        Ok(job)
    }

    /// Cancel a job from `pending` or `running`.
    ///
    /// A running job's worker gets a best-effort `/interrupt`; its outcome
    /// is logged and otherwise ignored, and the row is cancelled either way.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobRow, CoreError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or(CoreError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Running => {
                if let Some(worker_id) = job.worker_id {
                    if let Some(worker) = self.store.get_worker(worker_id)? {
                        self.spawn_interrupt(worker);
                    }
                }
            }
            terminal => {
                return Err(CoreError::InvalidState {
                    op: "cancel",
                    status: terminal.to_string(),
                })
            }
        }

        if !self.store.cancel_job(job_id)? {
            // The row reached a terminal status between the read and the
            // guarded update.
            let status = self
                .store
                .get_job(job_id)?
                .map(|j| j.status.to_string())
                .unwrap_or_else(|| "deleted".to_string());
            return Err(CoreError::InvalidState {
                op: "cancel",
                status,
            });
        }
        info!(job = %job_id, "Job cancelled");

        self.store.get_job(job_id)?.ok_or(CoreError::JobNotFound(job_id))
    }

    /// Pump the queue: repeatedly pair the top pending job with an idle
    /// worker and submit it, until one side runs dry. Idempotent and safe to
    /// call from anywhere.
    pub async fn try_dispatch(&self) -> Result<usize, CoreError> {
        let _guard = self.dispatch_lock.lock().await;
        let mut dispatched = 0usize;

        loop {
            let running = self.store.workers_with_status(WorkerStatus::Running)?;
            let busy = self.store.busy_worker_ids()?;
            let idle: Vec<WorkerRow> = running
                .into_iter()
                .filter(|w| !busy.contains(&w.id))
                .collect();
            if idle.is_empty() {
                break;
            }

            let pending = self.store.pending_jobs(PENDING_SCAN_LIMIT)?;
            // Highest priority first; a job pinned to a busy or absent
            // worker is passed over without blocking the rest of the queue.
            let Some((job, target)) = pending.into_iter().find_map(|job| {
                match job.worker_id {
                    Some(wanted) => idle
                        .iter()
                        .find(|w| w.id == wanted)
                        .cloned()
                        .map(|w| (job, w)),
                    None => Some((job, idle[0].clone())),
                }
            }) else {
                break;
            };

            if !self.store.claim_job(job.id, target.id)? {
                // Claimed elsewhere or the worker got busy; re-evaluate.
                continue;
            }

            debug!(job = %job.id, worker = %target.id, "Job bound to worker");
            self.submit(&job, &target).await?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// POST the workflow to the worker and record the terminal outcome.
    ///
    /// A transport failure or non-2xx marks the job failed; it never marks
    /// the worker; liveness is the lifecycle manager's judgement.
    async fn submit(&self, job: &JobRow, worker: &WorkerRow) -> Result<(), CoreError> {
        let url = format!("http://{}:{}/prompt", worker.host, worker.port);
        info!(job = %job.id, worker = %worker.id, url = %url, "Submitting job");

        let response = self
            .client
            .post(&url)
            .timeout(self.api_timeout)
            .json(&job.workflow_data)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                self.store.complete_job(job.id, &body)?;
                info!(job = %job.id, worker = %worker.id, "Job completed");
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let reason = format!("worker returned {status}: {body}");
                warn!(job = %job.id, worker = %worker.id, reason = %reason, "Job submission refused");
                self.store.fail_job(job.id, &reason)?;
            }
            Err(e) => {
                let reason = format!("request to {url} failed: {e}");
                warn!(job = %job.id, worker = %worker.id, reason = %reason, "Job submission failed");
                self.store.fail_job(job.id, &reason)?;
            }
        }
        Ok(())
    }

    /// Fire-and-forget `/interrupt`. The caller's cancel proceeds
    /// regardless of what the worker makes of it.
    fn spawn_interrupt(&self, worker: WorkerRow) {
        let client = self.client.clone();
        let timeout = self.api_timeout;
        tokio::spawn(async move {
            let url = format!("http://{}:{}/interrupt", worker.host, worker.port);
            match client.post(&url).timeout(timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(worker = %worker.id, "Interrupt delivered");
                }
                Ok(resp) => {
                    warn!(worker = %worker.id, status = %resp.status(), "Interrupt refused");
                }
                Err(e) => {
                    warn!(worker = %worker.id, error = %e, "Interrupt call failed");
                }
            }
        });
    }
}
