//! Mock worker for testing promptq.
//!
//! Stands in for the external inference worker: accepts the full launch flag
//! surface (ignoring most of it), prints the usual startup banner, and
//! serves the probe and prompt endpoints. Failure-injection switches let
//! tests script slow startups, fatal logs, and crashes.
//!
//! `POST /prompt` echoes the submitted workflow back, so tests can assert
//! the stored job output matches what was sent.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-worker")]
#[command(about = "Mock inference worker for testing")]
#[allow(dead_code)] // Most flags are accepted for contract compatibility only
struct Args {
    // ── Worker launch contract (accepted, mostly ignored) ──────────────────
    #[arg(long, default_value = "8188")]
    port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    listen: String,
    #[arg(long)]
    tls_keyfile: Option<String>,
    #[arg(long)]
    tls_certfile: Option<String>,

    #[arg(long)]
    output_directory: Option<String>,
    #[arg(long)]
    input_directory: Option<String>,
    #[arg(long)]
    temp_directory: Option<String>,
    #[arg(long)]
    user_directory: Option<String>,

    #[arg(long)]
    auto_launch: bool,
    #[arg(long)]
    disable_auto_launch: bool,
    #[arg(long)]
    dont_print_server: bool,
    #[arg(long)]
    multi_user: bool,
    #[arg(long)]
    windows_standalone_build: bool,

    #[arg(long)]
    cpu: bool,
    #[arg(long)]
    cuda_malloc: bool,
    #[arg(long)]
    disable_cuda_malloc: bool,

    #[arg(long)]
    force_fp32: bool,
    #[arg(long)]
    force_fp16: bool,
    #[arg(long)]
    fp32_unet: bool,
    #[arg(long)]
    fp16_unet: bool,
    #[arg(long)]
    bf16_unet: bool,
    #[arg(long)]
    fp32_vae: bool,
    #[arg(long)]
    fp16_vae: bool,
    #[arg(long)]
    bf16_vae: bool,
    #[arg(long)]
    cpu_vae: bool,
    #[arg(long)]
    fp32_text_enc: bool,
    #[arg(long)]
    fp16_text_enc: bool,
    #[arg(long)]
    fp8_e4m3fn_text_enc: bool,
    #[arg(long)]
    fp8_e5m2_text_enc: bool,

    #[arg(long)]
    use_split_cross_attention: bool,
    #[arg(long)]
    use_quad_cross_attention: bool,
    #[arg(long)]
    use_pytorch_cross_attention: bool,
    #[arg(long)]
    use_sage_attention: bool,
    #[arg(long)]
    use_flash_attention: bool,

    #[arg(long)]
    gpu_only: bool,
    #[arg(long)]
    highvram: bool,
    #[arg(long)]
    normalvram: bool,
    #[arg(long)]
    lowvram: bool,
    #[arg(long)]
    novram: bool,
    #[arg(long)]
    reserve_vram: Option<f64>,

    #[arg(long)]
    preview_method: Option<String>,
    #[arg(long)]
    preview_size: Option<u32>,

    #[arg(long)]
    cache_classic: bool,
    #[arg(long)]
    cache_lru: Option<u32>,
    #[arg(long)]
    cache_none: bool,

    /// Optimization presets: one flag, many values.
    #[arg(long, num_args = 0..)]
    fast: Vec<String>,

    #[arg(long)]
    verbose: Option<String>,
    #[arg(long)]
    disable_metadata: bool,
    #[arg(long)]
    disable_all_custom_nodes: bool,

    #[arg(long, action = clap::ArgAction::Append)]
    extra_model_paths_config: Vec<String>,

    // ── Failure injection (test harness only) ──────────────────────────────
    /// Delay between the startup banner and the listener coming up.
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Print an unrecoverable import error and exit 1 instead of serving.
    #[arg(long)]
    fatal: bool,

    /// Exit with this code after the startup delay instead of serving.
    #[arg(long)]
    exit_code: Option<i32>,

    /// Ignore SIGTERM, forcing the graceful kill path to escalate.
    #[arg(long)]
    ignore_sigterm: bool,

    /// Suppress the startup banner.
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Default)]
struct MockState {
    prompts: AtomicU64,
    interrupts: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_worker=debug")
        .init();

    let args = Args::parse();

    if args.fatal {
        eprintln!("Traceback (most recent call last):");
        eprintln!("ModuleNotFoundError: No module named 'torch'");
        std::process::exit(1);
    }

    #[cfg(unix)]
    if args.ignore_sigterm {
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
    }

    if !args.quiet {
        // The banner the orchestrator's log classifier keys on.
        println!("Starting server on localhost:{}", args.port);
    }

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    if let Some(code) = args.exit_code {
        eprintln!("exiting with code {code} as requested");
        std::process::exit(code);
    }

    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/system_stats", get(system_stats))
        .route("/prompt", get(prompt_queue).post(prompt_submit))
        .route("/interrupt", post(interrupt))
        .route("/", get(|| async { "ok" }))
        .with_state(state);

    let addr = format!("{}:{}", args.listen, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Mock worker listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn system_stats(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(json!({
        "system": {
            "os": std::env::consts::OS,
            "python_version": "3.12.0 (mock)",
        },
        "devices": [],
        "prompts_received": state.prompts.load(Ordering::SeqCst),
        "interrupts_received": state.interrupts.load(Ordering::SeqCst),
    }))
}

async fn prompt_queue() -> Json<Value> {
    Json(json!({ "queue_running": [], "queue_pending": [] }))
}

async fn prompt_submit(
    State(state): State<Arc<MockState>>,
    Json(workflow): Json<Value>,
) -> Json<Value> {
    state.prompts.fetch_add(1, Ordering::SeqCst);
    Json(workflow)
}

async fn interrupt(State(state): State<Arc<MockState>>) -> StatusCode {
    state.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}
