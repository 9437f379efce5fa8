//! Locating a runtime interpreter for the worker install.
//!
//! Workers are Python programs launched as `<runtime> main.py ...`. The
//! locator finds a suitable interpreter near the install directory, checks it
//! actually is Python, and remembers the answer twice over: an in-memory
//! cache for the life of this process and a persisted config entry
//! (`RUNTIME_PATH`) so later launches skip the disk scan entirely.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::{Store, RUNTIME_PATH_KEY};
use crate::types::CoreError;

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);
const ENV_DIR_NAMES: [&str; 4] = ["venv", ".venv", "env", ".env"];
const BIN_DIR_NAMES: [&str; 2] = ["bin", "Scripts"];
const CONDA_SCAN_DEPTH: usize = 4;

#[cfg(windows)]
const INTERPRETER_NAMES: [&str; 2] = ["python.exe", "python3.exe"];
#[cfg(not(windows))]
const INTERPRETER_NAMES: [&str; 2] = ["python3", "python"];

/// Result of probing one interpreter candidate.
#[derive(Debug, Clone)]
pub struct RuntimeCheck {
    pub valid: bool,
    pub version: Option<String>,
}

pub struct RuntimeLocator {
    store: Arc<Store>,
    cache: Mutex<HashMap<PathBuf, PathBuf>>,
    scans: AtomicUsize,
}

impl RuntimeLocator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            scans: AtomicUsize::new(0),
        }
    }

    /// Find a validated interpreter for `install_path`.
    ///
    /// Resolution order: in-memory cache, persisted `RUNTIME_PATH` override,
    /// a scan of venv/conda layouts under the install directory (persisted on
    /// success), and finally whatever the OS path resolver finds.
    pub async fn locate(&self, install_path: &Path) -> Result<PathBuf, CoreError> {
        if let Some(cached) = self.cached(install_path) {
            debug!(runtime = %cached.display(), "Runtime cache hit");
            return Ok(cached);
        }

        if let Some(configured) = self.store.get_config(RUNTIME_PATH_KEY)? {
            let path = PathBuf::from(&configured);
            let check = validate(&path).await;
            if check.valid {
                debug!(runtime = %path.display(), "Using persisted runtime override");
                self.remember(install_path, &path);
                return Ok(path);
            }
            warn!(
                runtime = %configured,
                "Persisted runtime no longer validates, falling back to scan"
            );
        }

        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(found) = self.scan(install_path).await {
            info!(runtime = %found.display(), "Located runtime in worker install");
            self.store.set_config(
                RUNTIME_PATH_KEY,
                &found.to_string_lossy(),
                Some("Interpreter used to launch workers"),
            )?;
            self.remember(install_path, &found);
            return Ok(found);
        }

        if let Some(system) = resolve_on_path().await {
            info!(runtime = %system.display(), "Falling back to system interpreter");
            self.remember(install_path, &system);
            return Ok(system);
        }

        Err(CoreError::RuntimeNotFound {
            install_path: install_path.display().to_string(),
        })
    }

    /// Drop the in-memory cache. The persisted override is untouched.
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of disk scans performed so far. Exposed so tests can assert
    /// the cache actually short-circuits.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    fn cached(&self, install_path: &Path) -> Option<PathBuf> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(install_path)
            .cloned()
    }

    fn remember(&self, install_path: &Path, runtime: &Path) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(install_path.to_path_buf(), runtime.to_path_buf());
    }

    async fn scan(&self, install_path: &Path) -> Option<PathBuf> {
        for env_dir in ENV_DIR_NAMES {
            for bin_dir in BIN_DIR_NAMES {
                for exe in INTERPRETER_NAMES {
                    let candidate = install_path.join(env_dir).join(bin_dir).join(exe);
                    if candidate.is_file() && validate(&candidate).await.valid {
                        return Some(candidate);
                    }
                }
            }
        }

        let conda_root = install_path.join("conda_env");
        if conda_root.is_dir() {
            if let Some(found) = scan_conda(&conda_root, CONDA_SCAN_DEPTH) {
                if validate(&found).await.valid {
                    return Some(found);
                }
            }
        }

        None
    }
}

/// Invoke a candidate with `--version` and require "python" (any case) in
/// its combined output.
pub async fn validate(path: &Path) -> RuntimeCheck {
    let run = tokio::time::timeout(
        VALIDATE_TIMEOUT,
        tokio::process::Command::new(path).arg("--version").output(),
    )
    .await;

    let out = match run {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            debug!(candidate = %path.display(), error = %e, "Runtime candidate not invocable");
            return RuntimeCheck {
                valid: false,
                version: None,
            };
        }
        Err(_) => {
            debug!(candidate = %path.display(), "Runtime candidate timed out on --version");
            return RuntimeCheck {
                valid: false,
                version: None,
            };
        }
    };

    // Older interpreters print the version banner to stderr.
    let mut combined = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if combined.is_empty() {
        combined = String::from_utf8_lossy(&out.stderr).trim().to_string();
    }
    let valid = out.status.success() && combined.to_lowercase().contains("python");
    RuntimeCheck {
        version: if combined.is_empty() {
            None
        } else {
            Some(combined)
        },
        valid,
    }
}

/// Depth-limited search for an interpreter under a conda-style env tree.
fn scan_conda(dir: &Path, depth: usize) -> Option<PathBuf> {
    for bin_dir in BIN_DIR_NAMES {
        for exe in INTERPRETER_NAMES {
            let candidate = dir.join(bin_dir).join(exe);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    if depth == 0 {
        return None;
    }
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = scan_conda(&path, depth - 1) {
                return Some(found);
            }
        }
    }
    None
}

/// Ask the OS path resolver for a bare interpreter name.
async fn resolve_on_path() -> Option<PathBuf> {
    #[cfg(windows)]
    let resolver = "where";
    #[cfg(not(windows))]
    let resolver = "which";

    for name in INTERPRETER_NAMES {
        let output = tokio::process::Command::new(resolver)
            .arg(name)
            .output()
            .await;
        if let Ok(out) = output {
            if out.status.success() {
                let raw = String::from_utf8_lossy(&out.stdout);
                if let Some(first) = raw.lines().next() {
                    let path = PathBuf::from(first.trim());
                    if validate(&path).await.valid {
                        return Some(path);
                    }
                }
            }
        }
    }
    None
}
