//! macOS GPU probe.
//!
//! There is no `nvidia-smi` equivalent for Metal, so the probe runs a small
//! script under the worker's own runtime and asks the ML framework what it
//! can see. Utilization and live VRAM cannot be read this way; those fields
//! stay `None` so the schema keeps "unknown" distinct from "idle".

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{GpuDevice, GpuInventory, HostMetrics, HostSampler, KillMode, PlatformProbe};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const DEVICE_PROBE_SCRIPT: &str = r#"
import json
try:
    import torch
    cuda = torch.cuda.is_available()
    mps = hasattr(torch.backends, "mps") and torch.backends.mps.is_available()
    devices = []
    if cuda:
        for i in range(torch.cuda.device_count()):
            devices.append({"index": i, "name": torch.cuda.get_device_name(i)})
    elif mps:
        devices.append({"index": 0, "name": "Apple Metal (MPS)"})
    print(json.dumps({"available": cuda or mps, "devices": devices}))
except Exception:
    print(json.dumps({"available": False, "devices": []}))
"#;

#[derive(Debug, Deserialize)]
struct ProbeReport {
    available: bool,
    #[serde(default)]
    devices: Vec<ProbeDevice>,
}

#[derive(Debug, Deserialize)]
struct ProbeDevice {
    index: u32,
    name: String,
}

pub struct MacProbe {
    /// Interpreter used to run the device probe script. Falls back to
    /// whatever `python3` resolves to when the locator has not run yet.
    runtime: PathBuf,
    host: HostSampler,
}

impl MacProbe {
    pub fn new(runtime: Option<PathBuf>) -> Self {
        Self {
            runtime: runtime.unwrap_or_else(|| PathBuf::from("python3")),
            host: HostSampler::new(),
        }
    }
}

#[async_trait]
impl PlatformProbe for MacProbe {
    async fn gpu_inventory(&self) -> GpuInventory {
        let run = tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::process::Command::new(&self.runtime)
                .args(["-c", DEVICE_PROBE_SCRIPT])
                .output(),
        )
        .await;

        let out = match run {
            Ok(Ok(out)) if out.status.success() => out,
            Ok(Ok(out)) => {
                warn!(status = %out.status, "Device probe script failed");
                return GpuInventory::default();
            }
            Ok(Err(e)) => {
                warn!(runtime = %self.runtime.display(), error = %e, "Device probe not invocable");
                return GpuInventory::default();
            }
            Err(_) => {
                warn!("Device probe script timed out");
                return GpuInventory::default();
            }
        };

        let report: ProbeReport =
            match serde_json::from_slice(&out.stdout) {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Device probe produced unparseable output");
                    return GpuInventory::default();
                }
            };

        GpuInventory {
            available: report.available,
            devices: report
                .devices
                .into_iter()
                .map(|d| GpuDevice {
                    index: d.index,
                    name: d.name,
                    vram_used_mb: None,
                    vram_total_mb: None,
                    utilization_pct: None,
                    temperature_c: None,
                    fan_speed_pct: None,
                    power_w: None,
                    power_limit_w: None,
                })
                .collect(),
        }
    }

    async fn host_metrics(&self) -> HostMetrics {
        self.host.sample()
    }

    fn process_alive(&self, pid: u32) -> bool {
        super::process_alive(pid)
    }

    async fn kill_process(&self, pid: u32, mode: KillMode) -> bool {
        super::kill_process(pid, mode).await
    }
}
