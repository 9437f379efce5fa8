//! Embedded SQLite store shared by the lifecycle manager, scheduler, and
//! sampler.
//!
//! Four tables: `workers`, `jobs`, `metrics`, `config`. All timestamps are
//! unix seconds. Job status updates are guarded at the query level (`WHERE
//! status IN (...)`) so a row can only move forward through
//! `pending -> running -> {completed, failed, cancelled}`; a lost race shows
//! up as zero affected rows, never as a regression.
//!
//! The connection sits behind a `std::sync::Mutex`. Every critical section is
//! a handful of statements with no I/O awaits inside, so callers on the async
//! runtime never hold the lock across a suspension point.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::types::{now_ts, CoreError, JobStatus, WorkerStatus};

/// Config-store key holding the validated interpreter path.
pub const RUNTIME_PATH_KEY: &str = "RUNTIME_PATH";
/// Config-store key holding the worker install directory.
pub const WORKER_INSTALL_PATH_KEY: &str = "WORKER_INSTALL_PATH";

#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub device_selector: String,
    pub options: JsonValue,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub workflow_data: JsonValue,
    pub priority: i64,
    pub status: JobStatus,
    pub worker_id: Option<Uuid>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for a new worker record. `host` and `device_selector` fall back to
/// `127.0.0.1` and `cpu`.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub name: String,
    pub host: Option<String>,
    pub port: u16,
    pub device_selector: Option<String>,
    pub options: JsonValue,
}

/// One metric observation to append. Absent numeric fields mean "unknown",
/// which is distinct from zero.
#[derive(Debug, Clone, Default)]
pub struct MetricInsert {
    pub worker_id: Option<Uuid>,
    pub gpu_index: Option<i64>,
    pub vram_used_mb: Option<f64>,
    pub vram_total_mb: Option<f64>,
    pub gpu_utilization_pct: Option<f64>,
    pub ram_used_mb: Option<f64>,
    pub cpu_utilization_pct: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MetricRow {
    pub id: i64,
    pub worker_id: Option<Uuid>,
    pub timestamp: i64,
    pub gpu_index: Option<i64>,
    pub vram_used_mb: Option<f64>,
    pub vram_total_mb: Option<f64>,
    pub gpu_utilization_pct: Option<f64>,
    pub ram_used_mb: Option<f64>,
    pub cpu_utilization_pct: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Workers ─────────────────────────────────────────────────────────────

    pub fn create_worker(&self, new: NewWorker) -> Result<WorkerRow, CoreError> {
        let conn = self.lock();
        let ts = now_ts();

        // Ports must be unique among workers that could be listening.
        let clash: Option<String> = conn
            .query_row(
                "SELECT id FROM workers WHERE port = ?1 AND status != 'stopped'",
                params![new.port],
                |row| row.get(0),
            )
            .optional()?;
        if clash.is_some() {
            return Err(CoreError::InvalidState {
                op: "create_worker",
                status: format!("port {} already in use", new.port),
            });
        }

        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO workers (id, name, host, port, device_selector, options, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'stopped', ?7, ?7)",
            params![
                id.to_string(),
                new.name,
                new.host.as_deref().unwrap_or("127.0.0.1"),
                new.port,
                new.device_selector.as_deref().unwrap_or("cpu"),
                new.options.to_string(),
                ts,
            ],
        )?;
        drop(conn);
        self.get_worker(id)?.ok_or(CoreError::WorkerNotFound(id))
    }

    pub fn get_worker(&self, id: Uuid) -> Result<Option<WorkerRow>, CoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, host, port, device_selector, options, status, pid, last_error,
                        created_at, updated_at
                 FROM workers WHERE id = ?1",
                params![id.to_string()],
                worker_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerRow>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, host, port, device_selector, options, status, pid, last_error,
                    created_at, updated_at
             FROM workers ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], worker_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn workers_with_status(&self, status: WorkerStatus) -> Result<Vec<WorkerRow>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, host, port, device_selector, options, status, pid, last_error,
                    created_at, updated_at
             FROM workers WHERE status = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![status.as_str()], worker_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Persist a worker status transition.
    ///
    /// `pid` is only stored for statuses that hold one (`starting`,
    /// `running`); otherwise the column is cleared. An `error` status always
    /// ends up with a populated `last_error`: the given one, the existing
    /// one, or a generic fallback.
    pub fn update_worker_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
        pid: Option<u32>,
        last_error: Option<&str>,
    ) -> Result<(), CoreError> {
        let conn = self.lock();
        let ts = now_ts();
        let pid = if status.holds_pid() { pid } else { None };
        let affected = if status == WorkerStatus::Error {
            conn.execute(
                "UPDATE workers
                 SET status = ?2, pid = ?3,
                     last_error = COALESCE(?4, last_error, 'unknown error'),
                     updated_at = ?5
                 WHERE id = ?1",
                params![id.to_string(), status.as_str(), pid, last_error, ts],
            )?
        } else {
            conn.execute(
                "UPDATE workers SET status = ?2, pid = ?3, last_error = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![id.to_string(), status.as_str(), pid, last_error, ts],
            )?
        };
        if affected == 0 {
            return Err(CoreError::WorkerNotFound(id));
        }
        Ok(())
    }

    pub fn set_worker_port(&self, id: Uuid, port: u16) -> Result<(), CoreError> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE workers SET port = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), port, now_ts()],
        )?;
        if affected == 0 {
            return Err(CoreError::WorkerNotFound(id));
        }
        Ok(())
    }

    pub fn set_worker_device_selector(&self, id: Uuid, selector: &str) -> Result<(), CoreError> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE workers SET device_selector = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), selector, now_ts()],
        )?;
        if affected == 0 {
            return Err(CoreError::WorkerNotFound(id));
        }
        Ok(())
    }

    /// Delete a worker. Refused while any of its jobs is non-terminal.
    pub fn delete_worker(&self, id: Uuid) -> Result<(), CoreError> {
        let conn = self.lock();
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE worker_id = ?1 AND status IN ('pending', 'running')",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(CoreError::InvalidState {
                op: "delete_worker",
                status: format!("{active} active job(s) reference this worker"),
            });
        }
        let affected = conn.execute(
            "DELETE FROM workers WHERE id = ?1",
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Err(CoreError::WorkerNotFound(id));
        }
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        workflow_data: &JsonValue,
        priority: i64,
        worker_id: Option<Uuid>,
    ) -> Result<JobRow, CoreError> {
        let conn = self.lock();
        let id = Uuid::new_v4();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO jobs (id, workflow_data, priority, status, worker_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
            params![
                id.to_string(),
                workflow_data.to_string(),
                priority,
                worker_id.map(|w| w.to_string()),
                ts,
            ],
        )?;
        drop(conn);
        self.get_job(id)?.ok_or(CoreError::JobNotFound(id))
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<JobRow>, CoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, workflow_data, priority, status, worker_id, output, error,
                        started_at, completed_at, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Pending jobs in dispatch order: priority descending, oldest first,
    /// insertion order as the final tie-break.
    pub fn pending_jobs(&self, limit: usize) -> Result<Vec<JobRow>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_data, priority, status, worker_id, output, error,
                    started_at, completed_at, created_at, updated_at
             FROM jobs WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], job_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Worker ids that currently have a job in `running`.
    pub fn busy_worker_ids(&self) -> Result<Vec<Uuid>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT worker_id FROM jobs WHERE status = 'running' AND worker_id IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            if let Ok(id) = Uuid::parse_str(&raw?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Atomically move a pending job to `running` bound to `worker_id`.
    ///
    /// Returns false if the job is no longer pending or the worker already
    /// has a running job. Both guards live in the statement itself so two
    /// racing dispatchers cannot double-bind.
    pub fn claim_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, CoreError> {
        let conn = self.lock();
        let ts = now_ts();
        let affected = conn.execute(
            "UPDATE jobs SET status = 'running', worker_id = ?2, started_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM jobs WHERE worker_id = ?2 AND status = 'running'
               )",
            params![job_id.to_string(), worker_id.to_string(), ts],
        )?;
        debug!(job = %job_id, worker = %worker_id, claimed = affected > 0, "Job claim attempted");
        Ok(affected > 0)
    }

    /// Mark a running job completed, storing the raw worker response.
    pub fn complete_job(&self, id: Uuid, output: &str) -> Result<bool, CoreError> {
        let conn = self.lock();
        let ts = now_ts();
        let affected = conn.execute(
            "UPDATE jobs SET status = 'completed', output = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id.to_string(), output, ts],
        )?;
        Ok(affected > 0)
    }

    /// Mark a running job failed with the transport or worker error text.
    pub fn fail_job(&self, id: Uuid, error: &str) -> Result<bool, CoreError> {
        let conn = self.lock();
        let ts = now_ts();
        let affected = conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status = 'running'",
            params![id.to_string(), error, ts],
        )?;
        Ok(affected > 0)
    }

    /// Cancel a job from `pending` or `running`.
    pub fn cancel_job(&self, id: Uuid) -> Result<bool, CoreError> {
        let conn = self.lock();
        let ts = now_ts();
        let affected = conn.execute(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![id.to_string(), ts],
        )?;
        Ok(affected > 0)
    }

    pub fn jobs_for_worker(&self, worker_id: Uuid) -> Result<Vec<JobRow>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_data, priority, status, worker_id, output, error,
                    started_at, completed_at, created_at, updated_at
             FROM jobs WHERE worker_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![worker_id.to_string()], job_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Metrics ─────────────────────────────────────────────────────────────

    pub fn insert_metric(&self, m: &MetricInsert) -> Result<(), CoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO metrics (worker_id, timestamp, gpu_index, vram_used_mb, vram_total_mb,
                                  gpu_utilization_pct, ram_used_mb, cpu_utilization_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                m.worker_id.map(|w| w.to_string()),
                now_ts(),
                m.gpu_index,
                m.vram_used_mb,
                m.vram_total_mb,
                m.gpu_utilization_pct,
                m.ram_used_mb,
                m.cpu_utilization_pct,
            ],
        )?;
        Ok(())
    }

    pub fn metrics_for_worker(
        &self,
        worker_id: Uuid,
        limit: usize,
    ) -> Result<Vec<MetricRow>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, worker_id, timestamp, gpu_index, vram_used_mb, vram_total_mb,
                    gpu_utilization_pct, ram_used_mb, cpu_utilization_pct
             FROM metrics WHERE worker_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![worker_id.to_string(), limit as i64], metric_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Config ──────────────────────────────────────────────────────────────

    /// Upsert a config entry. Last writer wins per key.
    pub fn set_config(
        &self,
        key: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<(), CoreError> {
        let conn = self.lock();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO config (key, value, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 description = COALESCE(excluded.description, config.description),
                 updated_at = excluded.updated_at",
            params![key, value, description, ts],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>, CoreError> {
        let conn = self.lock();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_config(&self, key: &str) -> Result<(), CoreError> {
        let conn = self.lock();
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn list_config(&self) -> Result<Vec<ConfigEntry>, CoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT key, value, description FROM config ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ConfigEntry {
                key: row.get(0)?,
                value: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS workers (
             id              TEXT PRIMARY KEY,
             name            TEXT NOT NULL,
             host            TEXT NOT NULL DEFAULT '127.0.0.1',
             port            INTEGER NOT NULL,
             device_selector TEXT NOT NULL DEFAULT 'cpu',
             options         TEXT NOT NULL DEFAULT '{}',
             status          TEXT NOT NULL DEFAULT 'stopped',
             pid             INTEGER,
             last_error      TEXT,
             created_at      INTEGER NOT NULL,
             updated_at      INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS jobs (
             id            TEXT PRIMARY KEY,
             workflow_data TEXT NOT NULL,
             priority      INTEGER NOT NULL DEFAULT 0,
             status        TEXT NOT NULL DEFAULT 'pending',
             worker_id     TEXT REFERENCES workers(id),
             output        TEXT,
             error         TEXT,
             started_at    INTEGER,
             completed_at  INTEGER,
             created_at    INTEGER NOT NULL,
             updated_at    INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_jobs_pending
             ON jobs (status, priority DESC, created_at ASC);
         CREATE INDEX IF NOT EXISTS idx_jobs_worker ON jobs (worker_id, status);
         CREATE TABLE IF NOT EXISTS metrics (
             id                  INTEGER PRIMARY KEY AUTOINCREMENT,
             worker_id           TEXT,
             timestamp           INTEGER NOT NULL,
             gpu_index           INTEGER,
             vram_used_mb        REAL,
             vram_total_mb       REAL,
             gpu_utilization_pct REAL,
             ram_used_mb         REAL,
             cpu_utilization_pct REAL
         );
         CREATE INDEX IF NOT EXISTS idx_metrics_worker ON metrics (worker_id, timestamp);
         CREATE TABLE IF NOT EXISTS config (
             key         TEXT PRIMARY KEY,
             value       TEXT NOT NULL,
             description TEXT,
             created_at  INTEGER NOT NULL,
             updated_at  INTEGER NOT NULL
         );",
    )
}

fn worker_from_row(row: &Row<'_>) -> Result<WorkerRow, rusqlite::Error> {
    let id: String = row.get(0)?;
    let options_raw: String = row.get(5)?;
    let status_raw: String = row.get(6)?;
    Ok(WorkerRow {
        id: parse_uuid(&id, 0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get::<_, i64>(3)? as u16,
        device_selector: row.get(4)?,
        options: serde_json::from_str(&options_raw).unwrap_or(JsonValue::Null),
        status: WorkerStatus::parse(&status_raw).unwrap_or(WorkerStatus::Error),
        pid: row.get::<_, Option<i64>>(7)?.map(|p| p as u32),
        last_error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn job_from_row(row: &Row<'_>) -> Result<JobRow, rusqlite::Error> {
    let id: String = row.get(0)?;
    let workflow_raw: String = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let worker_raw: Option<String> = row.get(4)?;
    let output_raw: Option<String> = row.get(5)?;
    Ok(JobRow {
        id: parse_uuid(&id, 0)?,
        workflow_data: serde_json::from_str(&workflow_raw).unwrap_or(JsonValue::Null),
        priority: row.get(2)?,
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Failed),
        worker_id: worker_raw.and_then(|w| Uuid::parse_str(&w).ok()),
        output: output_raw.map(|o| serde_json::from_str(&o).unwrap_or(JsonValue::String(o))),
        error: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn metric_from_row(row: &Row<'_>) -> Result<MetricRow, rusqlite::Error> {
    let worker_raw: Option<String> = row.get(1)?;
    Ok(MetricRow {
        id: row.get(0)?,
        worker_id: worker_raw.and_then(|w| Uuid::parse_str(&w).ok()),
        timestamp: row.get(2)?,
        gpu_index: row.get(3)?,
        vram_used_mb: row.get(4)?,
        vram_total_mb: row.get(5)?,
        gpu_utilization_pct: row.get(6)?,
        ram_used_mb: row.get(7)?,
        cpu_utilization_pct: row.get(8)?,
    })
}

fn parse_uuid(raw: &str, idx: usize) -> Result<Uuid, rusqlite::Error> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn worker(store: &Store, port: u16) -> WorkerRow {
        store
            .create_worker(NewWorker {
                name: format!("w{port}"),
                host: None,
                port,
                device_selector: Some("0".into()),
                options: json!({}),
            })
            .unwrap()
    }

    #[test]
    fn worker_create_and_fetch() {
        let s = store();
        let w = worker(&s, 8188);
        assert_eq!(w.status, WorkerStatus::Stopped);
        assert_eq!(w.host, "127.0.0.1");
        let fetched = s.get_worker(w.id).unwrap().unwrap();
        assert_eq!(fetched.port, 8188);
        assert!(fetched.pid.is_none());
    }

    #[test]
    fn port_unique_among_non_stopped() {
        let s = store();
        let w = worker(&s, 8188);
        // A stopped worker does not reserve the port.
        let _other = worker(&s, 8188);
        s.update_worker_status(w.id, WorkerStatus::Starting, Some(42), None)
            .unwrap();
        let err = s
            .create_worker(NewWorker {
                name: "clash".into(),
                host: None,
                port: 8188,
                device_selector: None,
                options: json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[test]
    fn error_status_always_carries_a_message() {
        let s = store();
        let w = worker(&s, 8190);
        s.update_worker_status(w.id, WorkerStatus::Error, None, None)
            .unwrap();
        let row = s.get_worker(w.id).unwrap().unwrap();
        assert_eq!(row.status, WorkerStatus::Error);
        assert!(row.last_error.is_some());
    }

    #[test]
    fn pid_cleared_for_non_live_statuses() {
        let s = store();
        let w = worker(&s, 8191);
        s.update_worker_status(w.id, WorkerStatus::Starting, Some(1234), None)
            .unwrap();
        assert_eq!(s.get_worker(w.id).unwrap().unwrap().pid, Some(1234));
        s.update_worker_status(w.id, WorkerStatus::Stopped, Some(1234), None)
            .unwrap();
        assert_eq!(s.get_worker(w.id).unwrap().unwrap().pid, None);
    }

    #[test]
    fn pending_order_is_priority_then_age() {
        let s = store();
        let low = s.create_job(&json!({"n": 1}), 0, None).unwrap();
        let high = s.create_job(&json!({"n": 2}), 10, None).unwrap();
        let mid = s.create_job(&json!({"n": 3}), 5, None).unwrap();
        let order: Vec<Uuid> = s.pending_jobs(10).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(order, vec![high.id, mid.id, low.id]);
    }

    #[test]
    fn same_priority_drains_oldest_first() {
        let s = store();
        let first = s.create_job(&json!({"n": 1}), 5, None).unwrap();
        let second = s.create_job(&json!({"n": 2}), 5, None).unwrap();
        let order: Vec<Uuid> = s.pending_jobs(10).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(order, vec![first.id, second.id]);
    }

    #[test]
    fn claim_is_exclusive_per_worker() {
        let s = store();
        let w = worker(&s, 8200);
        s.update_worker_status(w.id, WorkerStatus::Running, Some(1), None)
            .unwrap();
        let j1 = s.create_job(&json!({}), 0, None).unwrap();
        let j2 = s.create_job(&json!({}), 0, None).unwrap();
        assert!(s.claim_job(j1.id, w.id).unwrap());
        // Second claim against the same worker is refused by the guard.
        assert!(!s.claim_job(j2.id, w.id).unwrap());
        // Completing the first frees the worker.
        assert!(s.complete_job(j1.id, "{}").unwrap());
        assert!(s.claim_job(j2.id, w.id).unwrap());
    }

    #[test]
    fn job_status_never_regresses() {
        let s = store();
        let w = worker(&s, 8201);
        let j = s.create_job(&json!({}), 0, None).unwrap();
        assert!(s.claim_job(j.id, w.id).unwrap());
        assert!(s.complete_job(j.id, "\"done\"").unwrap());
        // Terminal rows reject every further transition.
        assert!(!s.fail_job(j.id, "late failure").unwrap());
        assert!(!s.cancel_job(j.id).unwrap());
        assert!(!s.claim_job(j.id, w.id).unwrap());
        let row = s.get_job(j.id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.output, Some(json!("done")));
    }

    #[test]
    fn cancel_from_pending_and_running() {
        let s = store();
        let w = worker(&s, 8202);
        let pending = s.create_job(&json!({}), 0, None).unwrap();
        assert!(s.cancel_job(pending.id).unwrap());
        let running = s.create_job(&json!({}), 0, None).unwrap();
        assert!(s.claim_job(running.id, w.id).unwrap());
        assert!(s.cancel_job(running.id).unwrap());
        assert_eq!(
            s.get_job(running.id).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn delete_worker_refused_with_active_jobs() {
        let s = store();
        let w = worker(&s, 8203);
        let j = s.create_job(&json!({}), 0, Some(w.id)).unwrap();
        let err = s.delete_worker(w.id).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert!(s.cancel_job(j.id).unwrap());
        s.delete_worker(w.id).unwrap();
        assert!(s.get_worker(w.id).unwrap().is_none());
    }

    #[test]
    fn config_upsert_last_writer_wins() {
        let s = store();
        s.set_config("RUNTIME_PATH", "/usr/bin/python3", Some("interpreter"))
            .unwrap();
        s.set_config("RUNTIME_PATH", "/opt/venv/bin/python", None)
            .unwrap();
        assert_eq!(
            s.get_config("RUNTIME_PATH").unwrap().as_deref(),
            Some("/opt/venv/bin/python")
        );
        s.delete_config("RUNTIME_PATH").unwrap();
        assert_eq!(s.get_config("RUNTIME_PATH").unwrap(), None);
    }

    #[test]
    fn metric_rows_keep_unknowns_null() {
        let s = store();
        let w = worker(&s, 8204);
        s.insert_metric(&MetricInsert {
            worker_id: Some(w.id),
            gpu_index: Some(0),
            vram_used_mb: None,
            vram_total_mb: Some(24_576.0),
            gpu_utilization_pct: None,
            ram_used_mb: Some(4096.0),
            cpu_utilization_pct: Some(12.5),
        })
        .unwrap();
        let rows = s.metrics_for_worker(w.id, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].vram_used_mb, None);
        assert_eq!(rows[0].vram_total_mb, Some(24_576.0));
    }
}
