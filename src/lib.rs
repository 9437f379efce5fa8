//! # promptq
//!
//! Orchestrates long-running inference worker processes and dispatches a
//! prioritized queue of prompt jobs to them over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        promptq                           │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ WorkerManager                                      │  │
//! │  │ - spawns <runtime> main.py per worker record       │  │
//! │  │ - classifies log lines, polls readiness            │  │
//! │  │ - graceful-then-forceful shutdown                  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────┐  ┌─────────────────────────────┐ │
//! │  │ Scheduler          │  │ Sampler                     │ │
//! │  │ - priority queue   │  │ - GPU/host metrics per tick │ │
//! │  │ - first idle wins  │  │ - attributed to workers     │ │
//! │  │ - POST /prompt     │  │                             │ │
//! │  └────────────────────┘  └─────────────────────────────┘ │
//! │            │                          │                  │
//! │            └────────┬─────────────────┘                  │
//! │                     ▼                                    │
//! │          Store (embedded SQLite)                         │
//! │   workers · jobs · metrics · config                      │
//! └──────────────────────────────────────────────────────────┘
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//!   [worker :8188]     [worker :8189]     [worker :8190]
//!    /system_stats · POST /prompt · POST /interrupt
//! ```

pub mod config;
pub mod platform;
pub mod ports;
pub mod runtime;
pub mod sampler;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use config::CoreConfig;
pub use platform::{default_probe, GpuDevice, GpuInventory, HostMetrics, KillMode, PlatformProbe};
pub use runtime::{RuntimeCheck, RuntimeLocator};
pub use sampler::{Sampler, SamplerHandle};
pub use scheduler::Scheduler;
pub use store::{ConfigEntry, JobRow, MetricInsert, MetricRow, NewWorker, Store, WorkerRow};
pub use types::{CoreError, JobStatus, WorkerStatus};
pub use worker::{
    Entrypoint, LineCallback, ReadyReport, WorkerManager, WorkerOptions, WorkerSnapshot,
    WorkerTimeouts,
};
