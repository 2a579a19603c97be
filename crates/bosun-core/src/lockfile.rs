//! Single-instance guard for the `bosund` daemon.
//!
//! `acquire()` uses `O_CREAT | O_EXCL` so two daemons racing will have
//! exactly one winner. A lockfile left behind by a crashed process is
//! detected via `kill(pid, 0)` and removed automatically.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub started_at: String,
    pub workspace_root: Option<String>,
    pub version: String,
}

pub enum AcquireResult {
    Acquired,
    AlreadyRunning(DaemonLockfile),
    StaleRemoved,
}

impl DaemonLockfile {
    pub fn path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".bosun")
            .join("daemon.lock")
    }

    pub fn acquire(&self) -> std::io::Result<AcquireResult> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self)
                    .map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read() {
                Some(existing) if existing.is_alive() => Ok(AcquireResult::AlreadyRunning(existing)),
                _ => {
                    tracing::info!("removing stale daemon lockfile");
                    Self::remove();
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    pub fn acquire_or_fail(&self) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire() {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!("daemon already running (pid={})", existing.pid));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => {
                    tracing::info!("stale lockfile removed, retrying acquire");
                    continue;
                }
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    pub fn read() -> Option<Self> {
        let content = std::fs::read_to_string(Self::path()).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove() {
        let _ = std::fs::remove_file(Self::path());
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    pub fn read_valid() -> Option<Self> {
        let lock = Self::read()?;
        if lock.is_alive() {
            Some(lock)
        } else {
            tracing::info!(pid = lock.pid, "removing stale daemon lockfile");
            Self::remove();
            None
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
