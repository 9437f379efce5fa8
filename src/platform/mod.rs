//! OS-neutral platform probes.
//!
//! One `PlatformProbe` implementation is selected at startup and shared
//! behind an `Arc`: NVIDIA-toolchain hosts parse `nvidia-smi` CSV output,
//! Windows hosts without it fall back to a WMI video-controller query, and
//! macOS interrogates the worker runtime for CUDA/Metal availability. Host
//! CPU/RAM always comes from `sysinfo`.
//!
//! Probe failures degrade: GPU inventory becomes "unavailable", host metrics
//! zero out, and a warning is logged. Callers never see an error from a
//! failed probe.

pub mod nvidia;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

/// How hard to kill: `Graceful` asks first and escalates, `Forceful` goes
/// straight to the OS hammer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    Graceful,
    Forceful,
}

/// A single GPU as reported by the platform. Unknown readings are `None`,
/// never zero, so idle and unreadable stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub vram_used_mb: Option<f64>,
    pub vram_total_mb: Option<f64>,
    pub utilization_pct: Option<f64>,
    pub temperature_c: Option<f64>,
    pub fan_speed_pct: Option<f64>,
    pub power_w: Option<f64>,
    pub power_limit_w: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuInventory {
    pub available: bool,
    pub devices: Vec<GpuDevice>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostMetrics {
    pub cpu_pct: f64,
    pub ram_used_mb: f64,
    pub ram_total_mb: f64,
}

#[async_trait]
pub trait PlatformProbe: Send + Sync {
    async fn gpu_inventory(&self) -> GpuInventory;
    async fn host_metrics(&self) -> HostMetrics;
    fn process_alive(&self, pid: u32) -> bool;
    async fn kill_process(&self, pid: u32, mode: KillMode) -> bool;
}

/// Select the probe for this host. Called once at startup.
pub fn default_probe() -> Arc<dyn PlatformProbe> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::MacProbe::new(None))
    }
    #[cfg(target_os = "windows")]
    {
        if nvidia::nvidia_smi_available() {
            Arc::new(nvidia::NvidiaSmiProbe::new())
        } else {
            Arc::new(windows::WmiProbe::new())
        }
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Arc::new(nvidia::NvidiaSmiProbe::new())
    }
}

/// Shared sysinfo-backed CPU/RAM sampler.
///
/// CPU utilization is a delta measurement, so the very first sample after
/// startup reads as zero; periodic callers converge on the next tick.
pub(crate) struct HostSampler {
    sys: Mutex<System>,
}

impl HostSampler {
    pub(crate) fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    pub(crate) fn sample(&self) -> HostMetrics {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let cpus = sys.cpus();
        let cpu_pct = if cpus.is_empty() {
            warn!("Host CPU probe returned no cores");
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
        };

        HostMetrics {
            cpu_pct,
            ram_used_mb: sys.used_memory() as f64 / 1024.0 / 1024.0,
            ram_total_mb: sys.total_memory() as f64 / 1024.0 / 1024.0,
        }
    }
}

/// Check whether a process exists without disturbing it.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    // Signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()),
        Err(e) => {
            warn!(pid, error = %e, "tasklist probe failed");
            false
        }
    }
}

/// Terminate `pid`, asking nicely first when `mode` is graceful.
///
/// Unix: SIGTERM, then poll liveness every 500 ms for up to 5 s, then
/// SIGKILL. Windows has no graceful tree signal, so both modes run
/// `taskkill /T /F`. Returns whether the OS confirms the process is gone.
pub(crate) async fn kill_process(pid: u32, mode: KillMode) -> bool {
    #[cfg(unix)]
    {
        if mode == KillMode::Graceful {
            debug!(pid, "Sending SIGTERM");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if !process_alive(pid) {
                    return true;
                }
            }
            warn!(pid, "Process ignored SIGTERM for 5s, escalating to SIGKILL");
        }
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        !process_alive(pid)
    }
    #[cfg(windows)]
    {
        let _ = mode;
        let output = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await;
        if let Err(e) = output {
            warn!(pid, error = %e, "taskkill failed");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        !process_alive(pid)
    }
}
