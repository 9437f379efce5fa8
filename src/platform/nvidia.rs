//! GPU inventory via the NVIDIA query tool.
//!
//! Used on Linux and on Windows hosts where `nvidia-smi` is on PATH. The
//! query asks for a fixed field order with units stripped, one CSV line per
//! device; fields the driver cannot report come back as `[N/A]` and parse to
//! `None`.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{GpuDevice, GpuInventory, HostMetrics, HostSampler, KillMode, PlatformProbe};

const QUERY_FIELDS: &str = "index,name,temperature.gpu,fan.speed,power.draw,power.limit,memory.used,memory.total,utilization.gpu";

/// Whether the NVIDIA query tool is invocable on this host.
pub fn nvidia_smi_available() -> bool {
    std::process::Command::new("nvidia-smi")
        .arg("--list-gpus")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub struct NvidiaSmiProbe {
    host: HostSampler,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            host: HostSampler::new(),
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformProbe for NvidiaSmiProbe {
    async fn gpu_inventory(&self) -> GpuInventory {
        let output = tokio::process::Command::new("nvidia-smi")
            .arg(format!("--query-gpu={QUERY_FIELDS}"))
            .arg("--format=csv,noheader,nounits")
            .output()
            .await;

        let out = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                warn!(
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "nvidia-smi query failed"
                );
                return GpuInventory::default();
            }
            Err(e) => {
                warn!(error = %e, "nvidia-smi not invocable");
                return GpuInventory::default();
            }
        };

        let devices = parse_query_csv(&String::from_utf8_lossy(&out.stdout));
        debug!(count = devices.len(), "GPU inventory refreshed");
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

/// Parse `--format=csv,noheader,nounits` output for [`QUERY_FIELDS`].
/// Malformed lines are dropped with a warning rather than failing the probe.
pub(crate) fn parse_query_csv(raw: &str) -> Vec<GpuDevice> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let device = parse_query_line(line);
            if device.is_none() {
                warn!(line, "Unparseable nvidia-smi CSV line");
            }
            device
        })
        .collect()
}

fn parse_query_line(line: &str) -> Option<GpuDevice> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 9 {
        return None;
    }
    Some(GpuDevice {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        temperature_c: num(fields[2]),
        fan_speed_pct: num(fields[3]),
        power_w: num(fields[4]),
        power_limit_w: num(fields[5]),
        vram_used_mb: num(fields[6]),
        vram_total_mb: num(fields[7]),
        utilization_pct: num(fields[8]),
    })
}

// "[N/A]" and "N/A" fail the parse and become None.
fn num(field: &str) -> Option<f64> {
    field.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_two_gpu_host() {
        let raw = "0, NVIDIA GeForce RTX 4090, 42, 30, 68.12, 450.00, 1024, 24564, 17\n\
                   1, NVIDIA GeForce RTX 4090, 39, 0, 21.50, 450.00, 0, 24564, 0\n";
        let devices = parse_query_csv(raw);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(devices[0].vram_used_mb, Some(1024.0));
        assert_eq!(devices[0].vram_total_mb, Some(24564.0));
        assert_eq!(devices[0].utilization_pct, Some(17.0));
        assert_eq!(devices[0].power_limit_w, Some(450.0));
        // Zero is a real reading, not an unknown.
        assert_eq!(devices[1].vram_used_mb, Some(0.0));
        assert_eq!(devices[1].utilization_pct, Some(0.0));
    }

    #[test]
    fn not_available_fields_become_none() {
        let raw = "0, Tesla T4, 55, [N/A], [N/A], 70.00, 512, 15360, 3";
        let devices = parse_query_csv(raw);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].fan_speed_pct, None);
        assert_eq!(devices[0].power_w, None);
        assert_eq!(devices[0].power_limit_w, Some(70.0));
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let raw = "garbage\n0, GPU, 1, 2, 3, 4, 5, 6, 7\nshort, line";
        let devices = parse_query_csv(raw);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].index, 0);
    }
}
