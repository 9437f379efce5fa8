//! Shared domain types used across the codebase.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a worker record.
///
/// Created in `Stopped`; moves to `Starting` on spawn, `Running` on the first
/// successful readiness probe, back to `Stopped` on clean termination, and to
/// `Error` on spawn failure, crash, or a fatal log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether a worker in this status may hold a live pid.
    pub fn holds_pid(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a queued job. `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("{op} not permitted in status {status}")]
    InvalidState { op: &'static str, status: String },

    #[error("failed to spawn worker process: {reason}")]
    SpawnFailure { reason: String },

    #[error("no usable runtime found under {install_path}")]
    RuntimeNotFound { install_path: String },

    #[error("probe timed out: {url}")]
    ProbeTimeout { url: String },

    #[error("worker emitted fatal log: {line}")]
    WorkerFatal { line: String },

    #[error("job submission failed: {reason}")]
    SubmitFailure { reason: String },

    #[error("platform probe failed: {reason}")]
    Platform { reason: String },

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current unix time in whole seconds. All persisted timestamps use this.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            WorkerStatus::Stopped,
            WorkerStatus::Starting,
            WorkerStatus::Running,
            WorkerStatus::Error,
        ] {
            assert_eq!(WorkerStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(WorkerStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
