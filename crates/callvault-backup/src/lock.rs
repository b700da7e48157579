//! Run-level lock
//!
//! Only one run may touch a backup directory at a time. The lock is a JSON
//! file created exclusively and removed when the guard drops. Locks older
//! than the configured staleness, or left by a dead process on this host,
//! are broken.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BackupError, BackupResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: DateTime<Utc>,
}

impl LockEntry {
    fn current() -> Self {
        Self {
            hostname: hostname(),
            pid: std::process::id(),
            time: Utc::now(),
        }
    }

    fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        if now - self.time > stale_after {
            return true;
        }
        self.hostname == hostname()
            && cfg!(target_os = "linux")
            && !Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

fn hostname() -> String {
    sys_info::hostname().unwrap_or_else(|_| "unknown".to_string())
}

/// Held for the whole run; releases the lock file on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path`, breaking it if it is stale
    pub fn acquire(path: &Path, stale_after: Duration) -> BackupResult<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let entry = serde_json::to_vec(&LockEntry::current())?;
                    file.write_all(&entry)?;
                    file.sync_all()?;
                    debug!("🔒 Acquired run lock {:?}", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read(path)
                        .ok()
                        .and_then(|bytes| serde_json::from_slice::<LockEntry>(&bytes).ok());
                    match holder {
                        Some(entry) if !entry.is_stale(stale_after, Utc::now()) => {
                            return Err(BackupError::Locked(format!(
                                "{} pid {} since {}",
                                entry.hostname, entry.pid, entry.time
                            )));
                        }
                        Some(entry) => {
                            warn!("🔓 Breaking stale run lock of {} pid {} from {}", entry.hostname, entry.pid, entry.time);
                        }
                        None => warn!("🔓 Breaking unreadable run lock {:?}", path),
                    }
                    match std::fs::remove_file(path) {
                        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                        _ => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BackupError::Locked(format!("{} was re-created concurrently", path.display())))
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("⚠️ Failed to release run lock {:?}: {}", self.path, e);
        } else {
            debug!("🔓 Released run lock {:?}", self.path);
        }
    }
}
