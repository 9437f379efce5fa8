//! End-to-end tests for promptq.
//!
//! Spins up mock workers two ways: in-process axum echo servers for
//! scheduler scenarios, and the `mock-worker` binary for real spawn,
//! readiness, and kill scenarios.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use promptq::{
    Entrypoint, GpuDevice, GpuInventory, HostMetrics, JobStatus, KillMode, NewWorker,
    PlatformProbe, RuntimeLocator, Sampler, Scheduler, Store, WorkerManager, WorkerOptions,
    WorkerStatus, WorkerTimeouts,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use uuid::Uuid;

// ── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct EchoState {
    prompts: Mutex<Vec<Value>>,
    interrupts: AtomicUsize,
}

/// Mock worker HTTP surface: records submitted workflows, echoes them back,
/// and counts interrupts.
async fn spawn_echo_worker() -> (u16, Arc<EchoState>) {
    let state = Arc::new(EchoState::default());

    async fn submit(State(state): State<Arc<EchoState>>, Json(body): Json<Value>) -> Json<Value> {
        state.prompts.lock().unwrap().push(body.clone());
        Json(body)
    }
    async fn interrupt(State(state): State<Arc<EchoState>>) -> StatusCode {
        state.interrupts.fetch_add(1, Ordering::SeqCst);
        StatusCode::OK
    }

    let app = Router::new()
        .route("/system_stats", get(|| async { Json(json!({})) }))
        .route("/prompt", get(|| async { Json(json!({})) }).post(submit))
        .route("/interrupt", post(interrupt))
        .route("/", get(|| async { "ok" }))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, state)
}

fn test_store() -> Arc<Store> {
    Arc::new(Store::open_in_memory().unwrap())
}

/// Insert a worker row already marked running, as if a previous launch and
/// readiness poll had succeeded.
fn insert_running_worker(store: &Store, port: u16, selector: &str) -> Uuid {
    let row = store
        .create_worker(NewWorker {
            name: format!("worker-{port}"),
            host: None,
            port,
            device_selector: Some(selector.to_string()),
            options: json!({}),
        })
        .unwrap();
    store
        .update_worker_status(row.id, WorkerStatus::Running, Some(4242), None)
        .unwrap();
    row.id
}

fn test_manager(store: Arc<Store>, install: &std::path::Path) -> WorkerManager {
    let locator = Arc::new(RuntimeLocator::new(store.clone()));
    WorkerManager::with_entrypoint(
        store,
        promptq::default_probe(),
        locator,
        install.to_path_buf(),
        WorkerTimeouts {
            startup: Duration::from_secs(15),
            check_interval: Duration::from_millis(500),
            api: Duration::from_secs(2),
        },
        Entrypoint::Command(mock_worker_bin()),
    )
}

fn mock_worker_bin() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_mock-worker"))
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ── Scheduler scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn queue_drains_in_priority_order() {
    let store = test_store();
    let (port, echo) = spawn_echo_worker().await;
    insert_running_worker(&store, port, "0");

    // Create both rows before any dispatch runs, so the pass sees a queue.
    let low = store.create_job(&json!({"job": "low"}), 0, None).unwrap();
    let high = store.create_job(&json!({"job": "high"}), 10, None).unwrap();

    let scheduler = Scheduler::new(store.clone(), Duration::from_secs(2));
    let dispatched = scheduler.try_dispatch().await.unwrap();
    assert_eq!(dispatched, 2);

    // The higher priority job reached the worker first.
    let seen = echo.prompts.lock().unwrap().clone();
    assert_eq!(seen, vec![json!({"job": "high"}), json!({"job": "low"})]);

    for (id, payload) in [(high.id, json!({"job": "high"})), (low.id, json!({"job": "low"}))] {
        let row = store.get_job(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        // Output is the echoed submission payload.
        assert_eq!(row.output, Some(payload));
    }
}

#[tokio::test]
async fn cancel_pending_never_contacts_a_worker() {
    let store = test_store();
    let (_, echo) = spawn_echo_worker().await;
    // No running workers at all.
    let scheduler = Scheduler::new(store.clone(), Duration::from_secs(2));
    let job = scheduler.enqueue(json!({"n": 1}), 5, None).await.unwrap();

    let cancelled = scheduler.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.worker_id, None);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(echo.interrupts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_running_interrupts_the_bound_worker() {
    let store = test_store();
    let (port, echo) = spawn_echo_worker().await;
    let worker_id = insert_running_worker(&store, port, "0");

    let job = store.create_job(&json!({"n": 1}), 0, None).unwrap();
    assert!(store.claim_job(job.id, worker_id).unwrap());

    let scheduler = Scheduler::new(store.clone(), Duration::from_secs(2));
    let cancelled = scheduler.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // The interrupt is fire-and-forget; give it a moment to land.
    assert!(
        wait_until(Duration::from_secs(3), || {
            echo.interrupts.load(Ordering::SeqCst) == 1
        })
        .await
    );

    // The worker counts as idle again: a new job dispatches to it.
    let next = store.create_job(&json!({"n": 2}), 0, None).unwrap();
    assert_eq!(scheduler.try_dispatch().await.unwrap(), 1);
    assert_eq!(
        store.get_job(next.id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn transport_failure_marks_job_failed_but_not_worker() {
    let store = test_store();
    // A port with nothing listening.
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let worker_id = insert_running_worker(&store, dead_port, "0");

    let scheduler = Scheduler::new(store.clone(), Duration::from_millis(500));
    let job = scheduler.enqueue(json!({"n": 1}), 0, None).await.unwrap();

    let row = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert!(row.error.is_some());
    // Worker liveness is judged elsewhere; the record stays running.
    assert_eq!(
        store.get_worker(worker_id).unwrap().unwrap().status,
        WorkerStatus::Running
    );
}

// ── Lifecycle scenarios (real spawned processes) ────────────────────────────

#[tokio::test]
async fn spawn_and_readiness_with_delayed_startup() {
    let store = test_store();
    let install = tempfile::tempdir().unwrap();
    let manager = test_manager(store.clone(), install.path());

    let port = promptq::ports::find_available(18_300).unwrap();
    let row = store
        .create_worker(NewWorker {
            name: "delayed".into(),
            host: None,
            port,
            device_selector: None,
            options: json!({}),
        })
        .unwrap();

    let started = Instant::now();
    let snapshot = manager
        .launch(
            row.id,
            WorkerOptions {
                port: Some(port),
                extra_args: vec!["--startup-delay-ms".into(), "2000".into()],
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(snapshot.status, WorkerStatus::Starting);
    assert!(snapshot.pid.is_some());

    let report = manager.ready(row.id, None, None).await.unwrap();
    assert!(report.ready);
    assert_eq!(report.status, WorkerStatus::Running);
    assert!(started.elapsed() < Duration::from_secs(10));

    // The startup banner was captured and classifies as a ready signal.
    let logs = manager.logs(row.id, None).await.unwrap();
    let banner = format!("Starting server on localhost:{port}");
    assert!(logs.contains(&banner), "logs: {logs:?}");
    assert_eq!(promptq::worker::classify(&banner), promptq::worker::LogClass::Ready);

    // The transition was persisted.
    assert_eq!(
        store.get_worker(row.id).unwrap().unwrap().status,
        WorkerStatus::Running
    );

    assert!(manager.stop(row.id).await.unwrap());
}

#[tokio::test]
async fn fatal_log_moves_worker_to_error() {
    let store = test_store();
    let install = tempfile::tempdir().unwrap();
    let manager = test_manager(store.clone(), install.path());

    let port = promptq::ports::find_available(18_400).unwrap();
    let row = store
        .create_worker(NewWorker {
            name: "fatal".into(),
            host: None,
            port,
            device_selector: None,
            options: json!({}),
        })
        .unwrap();

    manager
        .launch(
            row.id,
            WorkerOptions {
                port: Some(port),
                extra_args: vec!["--fatal".into()],
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();

    let report = manager
        .ready(row.id, Some(20), Some(Duration::from_millis(250)))
        .await
        .unwrap();
    assert!(!report.ready);
    assert_eq!(report.status, WorkerStatus::Error);

    let persisted = store.get_worker(row.id).unwrap().unwrap();
    assert_eq!(persisted.status, WorkerStatus::Error);
    assert!(persisted.last_error.is_some());
}

#[tokio::test]
async fn stdout_callback_sees_each_line() {
    let store = test_store();
    let install = tempfile::tempdir().unwrap();
    let manager = test_manager(store.clone(), install.path());

    let port = promptq::ports::find_available(18_500).unwrap();
    let row = store
        .create_worker(NewWorker {
            name: "callback".into(),
            host: None,
            port,
            device_selector: None,
            options: json!({}),
        })
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_cb = seen.clone();
    manager
        .launch(
            row.id,
            WorkerOptions {
                port: Some(port),
                ..Default::default()
            },
            Some(Arc::new(move |line: &str| {
                seen_cb.lock().unwrap().push(line.to_string());
            })),
            None,
        )
        .await
        .unwrap();

    let banner = format!("Starting server on localhost:{port}");
    assert!(
        wait_until(Duration::from_secs(5), || {
            seen.lock().unwrap().contains(&banner)
        })
        .await
    );
    manager.stop(row.id).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn stop_escalates_when_sigterm_is_ignored() {
    let store = test_store();
    let install = tempfile::tempdir().unwrap();
    let manager = test_manager(store.clone(), install.path());

    let port = promptq::ports::find_available(18_600).unwrap();
    let row = store
        .create_worker(NewWorker {
            name: "stubborn".into(),
            host: None,
            port,
            device_selector: None,
            options: json!({}),
        })
        .unwrap();

    manager
        .launch(
            row.id,
            WorkerOptions {
                port: Some(port),
                extra_args: vec!["--ignore-sigterm".into()],
                ..Default::default()
            },
            None,
            None,
        )
        .await
        .unwrap();
    let report = manager
        .ready(row.id, Some(30), Some(Duration::from_millis(250)))
        .await
        .unwrap();
    assert!(report.ready);

    // Graceful kill is ignored; forceful escalation lands within the bound.
    let started = Instant::now();
    let stopped = manager.stop(row.id).await.unwrap();
    let elapsed = started.elapsed();
    assert!(stopped);
    assert!(elapsed < Duration::from_secs(8), "took {elapsed:?}");
    assert_eq!(
        store.get_worker(row.id).unwrap().unwrap().status,
        WorkerStatus::Stopped
    );
}

// ── Metric attribution ──────────────────────────────────────────────────────

struct StubProbe {
    inventory: GpuInventory,
    host: HostMetrics,
}

#[async_trait::async_trait]
impl PlatformProbe for StubProbe {
    async fn gpu_inventory(&self) -> GpuInventory {
        self.inventory.clone()
    }
    async fn host_metrics(&self) -> HostMetrics {
        self.host.clone()
    }
    fn process_alive(&self, _pid: u32) -> bool {
        true
    }
    async fn kill_process(&self, _pid: u32, _mode: KillMode) -> bool {
        true
    }
}

fn stub_device(index: u32, used: f64) -> GpuDevice {
    GpuDevice {
        index,
        name: format!("Stub GPU {index}"),
        vram_used_mb: Some(used),
        vram_total_mb: Some(24_000.0),
        utilization_pct: Some(55.0),
        temperature_c: Some(60.0),
        fan_speed_pct: None,
        power_w: None,
        power_limit_w: Some(450.0),
    }
}

#[tokio::test]
async fn sampler_attributes_selected_devices() {
    let store = test_store();
    let worker_id = insert_running_worker(&store, 18_700, "0,1");

    let probe = Arc::new(StubProbe {
        inventory: GpuInventory {
            available: true,
            devices: vec![stub_device(0, 1000.0), stub_device(1, 2000.0)],
        },
        host: HostMetrics {
            cpu_pct: 37.5,
            ram_used_mb: 2048.0,
            ram_total_mb: 65_536.0,
        },
    });

    let sampler = Sampler::new(store.clone(), probe);
    let written = sampler.record_all().await.unwrap();
    assert_eq!(written, 2);

    let rows = store.metrics_for_worker(worker_id, 10).unwrap();
    assert_eq!(rows.len(), 2);
    let mut indices: Vec<i64> = rows.iter().filter_map(|r| r.gpu_index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);
    for row in &rows {
        assert_eq!(row.cpu_utilization_pct, Some(37.5));
        assert_eq!(row.ram_used_mb, Some(2048.0));
    }
}

#[tokio::test]
async fn sampler_skips_cpu_and_mps_workers() {
    let store = test_store();
    insert_running_worker(&store, 18_701, "cpu");
    insert_running_worker(&store, 18_702, "mps");

    let probe = Arc::new(StubProbe {
        inventory: GpuInventory {
            available: true,
            devices: vec![stub_device(0, 100.0)],
        },
        host: HostMetrics::default(),
    });

    let sampler = Sampler::new(store.clone(), probe);
    assert_eq!(sampler.record_all().await.unwrap(), 0);
}

#[tokio::test]
async fn sampler_timer_stop_is_idempotent() {
    let store = test_store();
    let probe = Arc::new(StubProbe {
        inventory: GpuInventory::default(),
        host: HostMetrics::default(),
    });
    let sampler = Sampler::new(store, probe);
    let mut handle = sampler.start(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.stop();
    handle.stop();
}
