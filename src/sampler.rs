//! Timer-driven resource sampling.
//!
//! Every tick attributes the current GPU inventory and host CPU/RAM to the
//! workers that are actually running. A failed probe skips the tick with a
//! warning; the timer itself never dies.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::platform::PlatformProbe;
use crate::store::{MetricInsert, Store};
use crate::types::{CoreError, WorkerStatus};

pub struct Sampler {
    store: Arc<Store>,
    probe: Arc<dyn PlatformProbe>,
}

/// Handle to a running sampler timer. Stopping is idempotent, and dropping
/// the handle stops the timer too.
pub struct SamplerHandle {
    task: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Sampler stopped");
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Sampler {
    pub fn new(store: Arc<Store>, probe: Arc<dyn PlatformProbe>) -> Arc<Self> {
        Arc::new(Self { store, probe })
    }

    /// Start the periodic timer. The first tick fires after one full
    /// interval.
    pub fn start(self: Arc<Self>, interval: Duration) -> SamplerHandle {
        let sampler = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // completes immediately
            loop {
                ticker.tick().await;
                if let Err(e) = sampler.record_all().await {
                    warn!(error = %e, "Metric tick skipped");
                }
            }
        });
        SamplerHandle { task: Some(task) }
    }

    /// Record one sample row per (running worker, matching GPU) pair.
    ///
    /// Device selectors are comma-separated GPU indices; `cpu` and `mps`
    /// tokens carry no per-device metrics and are skipped.
    pub async fn record_all(&self) -> Result<usize, CoreError> {
        let workers = self.store.workers_with_status(WorkerStatus::Running)?;
        if workers.is_empty() {
            return Ok(0);
        }

        let inventory = self.probe.gpu_inventory().await;
        let host = self.probe.host_metrics().await;

        let mut written = 0usize;
        for worker in &workers {
            for index in parse_selector_indices(&worker.device_selector) {
                let Some(device) = inventory.devices.iter().find(|d| d.index == index) else {
                    continue;
                };
                self.store.insert_metric(&MetricInsert {
                    worker_id: Some(worker.id),
                    gpu_index: Some(index as i64),
                    vram_used_mb: device.vram_used_mb,
                    vram_total_mb: device.vram_total_mb,
                    gpu_utilization_pct: device.utilization_pct,
                    ram_used_mb: Some(host.ram_used_mb),
                    cpu_utilization_pct: Some(host.cpu_pct),
                })?;
                written += 1;
            }
        }

        debug!(workers = workers.len(), rows = written, "Metric tick recorded");
        Ok(written)
    }
}

/// Integer GPU indices named by a device selector. Non-integer tokens
/// (`cpu`, `mps`, garbage) are skipped.
fn parse_selector_indices(selector: &str) -> Vec<u32> {
    selector
        .split(',')
        .filter_map(|token| token.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing() {
        assert_eq!(parse_selector_indices("0,1"), vec![0, 1]);
        assert_eq!(parse_selector_indices(" 2 , 5 "), vec![2, 5]);
        assert_eq!(parse_selector_indices("cpu"), Vec::<u32>::new());
        assert_eq!(parse_selector_indices("mps"), Vec::<u32>::new());
        assert_eq!(parse_selector_indices("0,cpu,3"), vec![0, 3]);
        assert_eq!(parse_selector_indices(""), Vec::<u32>::new());
    }
}
