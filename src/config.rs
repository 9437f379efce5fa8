//! Configuration for promptq.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::worker::WorkerTimeouts;

/// Top-level configuration.
///
/// Loaded from an optional JSON file, then overridden by the environment:
/// `STORAGE_URL`, `WORKER_STARTUP_TIMEOUT_MS`, `WORKER_CHECK_INTERVAL_MS`,
/// and `WORKER_API_TIMEOUT_MS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Database location. A plain path for the embedded store; `:memory:`
    /// is accepted for throwaway runs.
    pub storage_url: String,

    /// Directory containing the worker program (`main.py` plus its venv).
    pub install_path: PathBuf,

    /// Host workers are probed and submitted to.
    pub worker_host: String,

    /// Lowest port considered when allocating worker listeners.
    pub base_port: u16,

    /// Total time a worker gets to come up.
    pub startup_timeout_ms: u64,

    /// Pause between readiness probes.
    pub check_interval_ms: u64,

    /// Per-request deadline for every worker HTTP call.
    pub api_timeout_ms: u64,

    /// Pause between metric sampler ticks.
    pub sampler_interval_ms: u64,

    /// Pause between periodic dispatch pumps in the daemon.
    pub dispatch_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_url: "promptq.db".to_string(),
            install_path: PathBuf::from("."),
            worker_host: "127.0.0.1".to_string(),
            base_port: 8188,
            startup_timeout_ms: 120_000,
            check_interval_ms: 3_000,
            api_timeout_ms: 5_000,
            sampler_interval_ms: 5_000,
            dispatch_interval_ms: 2_000,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment overrides on top of whatever was loaded.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("STORAGE_URL") {
            if !url.is_empty() {
                self.storage_url = url;
            }
        }
        apply_ms_var("WORKER_STARTUP_TIMEOUT_MS", &mut self.startup_timeout_ms);
        apply_ms_var("WORKER_CHECK_INTERVAL_MS", &mut self.check_interval_ms);
        apply_ms_var("WORKER_API_TIMEOUT_MS", &mut self.api_timeout_ms);
        self
    }

    pub fn timeouts(&self) -> WorkerTimeouts {
        WorkerTimeouts {
            startup: Duration::from_millis(self.startup_timeout_ms),
            check_interval: Duration::from_millis(self.check_interval_ms.max(1)),
            api: Duration::from_millis(self.api_timeout_ms.max(1)),
        }
    }

    pub fn sampler_interval(&self) -> Duration {
        Duration::from_millis(self.sampler_interval_ms.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }
}

fn apply_ms_var(name: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<u64>() {
            Ok(ms) => *target = ms,
            Err(_) => warn!(var = name, value = %raw, "Ignoring unparseable duration override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.startup_timeout_ms, 120_000);
        assert_eq!(config.check_interval_ms, 3_000);
        assert_eq!(config.api_timeout_ms, 5_000);
        assert_eq!(config.sampler_interval_ms, 5_000);
        assert_eq!(config.worker_host, "127.0.0.1");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"storage_url": "/tmp/q.db", "base_port": 9000}"#).unwrap();
        assert_eq!(config.storage_url, "/tmp/q.db");
        assert_eq!(config.base_port, 9000);
        assert_eq!(config.api_timeout_ms, 5_000);
    }
}
