//! Windows fallback probe for hosts without the NVIDIA query tool.
//!
//! A WMI video-controller query only reliably exposes the adapter name and
//! total VRAM; used VRAM and utilization are unreadable this way and stay
//! `None`.

use async_trait::async_trait;
use tracing::warn;

use super::{GpuDevice, GpuInventory, HostMetrics, HostSampler, KillMode, PlatformProbe};

pub struct WmiProbe {
    host: HostSampler,
}

impl WmiProbe {
    pub fn new() -> Self {
        Self {
            host: HostSampler::new(),
        }
    }
}

impl Default for WmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformProbe for WmiProbe {
    async fn gpu_inventory(&self) -> GpuInventory {
        let output = tokio::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_VideoController | ForEach-Object { '{0}|{1}' -f $_.Name, $_.AdapterRAM }",
            ])
            .output()
            .await;

        let out = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                warn!(status = %out.status, "WMI video-controller query failed");
                return GpuInventory::default();
            }
            Err(e) => {
                warn!(error = %e, "powershell not invocable");
                return GpuInventory::default();
            }
        };

        let devices = parse_wmi_lines(&String::from_utf8_lossy(&out.stdout));
        GpuInventory {
            available: !devices.is_empty(),
            devices,
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

fn parse_wmi_lines(raw: &str) -> Vec<GpuDevice> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            let (name, ram) = line.rsplit_once('|').unwrap_or((line, ""));
            GpuDevice {
                index: index as u32,
                name: name.trim().to_string(),
                vram_used_mb: None,
                vram_total_mb: ram
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .map(|bytes| bytes / 1024.0 / 1024.0),
                utilization_pct: None,
                temperature_c: None,
                fan_speed_pct: None,
                power_w: None,
                power_limit_w: None,
            }
        })
        .collect()
}
