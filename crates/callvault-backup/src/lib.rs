//! Callvault Backup Engine
//!
//! Chain-aware backups of a telephony platform's database and filesystem:
//! - Full / incremental decisions from catalog lineage
//! - Integrity verification before anything becomes catalog visible
//! - Mirroring to local, SSH, FTP and S3 targets with bounded retries
//! - Chain-aware retention that always keeps a restorable chain
//! - Scheduled runs with clean cancellation
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::{collections::BTreeSet, path::PathBuf};

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod chain;
pub mod error;
pub mod lock;
pub mod model;
pub mod notify;
pub mod preflight;
pub mod producer;
pub mod remote;
pub mod retention;
pub mod run;
pub mod scheduler;
pub mod set_manager;
pub mod utils;
pub mod verify;

pub use catalog::Catalog;
pub use chain::{validate_lineage, Chain, ChainTracker, NextBackup};
pub use error::{BackupError, BackupResult, RemoteError, SnapshotError};
pub use model::{Artifact, ArtifactRole, BackupKind, BackupSet, SetId, UploadStatus};
pub use notify::{NotifyConfig, RunReport, RunStatus};
pub use producer::{DatabaseConfig, FilesystemConfig};
pub use remote::{
    ftp::FtpConfig, s3::S3Config, scp::ScpConfig, RemoteReceipt, RemoteSync, RemoteTarget, RetryPolicy,
};
pub use retention::{CleanupReport, RetentionEngine, RetentionPolicy};
pub use run::{BackupJob, RunContext};
pub use scheduler::BackupScheduler;

/// Backup destination and chain settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory holding the catalog, staging area and committed sets
    pub dir: PathBuf,
    /// Sets per chain before a new Full is taken (1 means every run is Full)
    pub history_depth: u32,
    /// Minimum free space required on the destination before a run
    pub min_free_space_mb: u64,
    /// Age after which a run lock is considered stale
    pub lock_stale_hours: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/backups/callvault"),
            history_depth: 7,
            min_free_space_mb: 1024,
            lock_stale_hours: 6,
        }
    }
}

/// Upload concurrency and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Targets uploaded to at the same time
    pub max_concurrent: usize,
    /// Timeout for a single transport operation
    pub op_timeout_secs: u64,
    /// Retry policy per (set, target)
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            op_timeout_secs: 3_600,
            retry: RetryPolicy::default(),
        }
    }
}

/// Transport of a remote target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Mounted directory
    Local {
        /// Directory sets are copied into
        path: PathBuf,
    },
    /// SSH host
    Scp(ScpConfig),
    /// FTP server
    Ftp(FtpConfig),
    /// S3 bucket
    S3(S3Config),
}

/// A named remote target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name, used as key of the per-set upload status
    pub name: String,
    /// Transport settings
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// Daemon schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Hours between runs
    pub interval_hours: u32,
    /// Run once immediately when the daemon starts
    pub run_on_start: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            run_on_start: false,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `callvault_backup=debug`
    pub level: String,
    /// Directory for daily rolling log files; stderr only when unset
    pub directory: Option<PathBuf>,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
            json: false,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallvaultConfig {
    /// Destination and chain settings
    pub backup: BackupConfig,
    /// Database dump
    pub database: DatabaseConfig,
    /// Filesystem snapshot
    pub filesystem: FilesystemConfig,
    /// Upload behaviour
    pub upload: UploadConfig,
    /// Retention policy
    pub retention: RetentionPolicy,
    /// Remote targets
    pub targets: Vec<TargetConfig>,
    /// Daemon schedule
    pub schedule: ScheduleConfig,
    /// Run report delivery
    pub notify: NotifyConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl CallvaultConfig {
    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> BackupResult<()> {
        if self.backup.history_depth == 0 {
            return Err(BackupError::config("backup.history_depth must be at least 1"));
        }
        if self.retention.max_age_days == 0 {
            return Err(BackupError::config("retention.max_age_days must be at least 1"));
        }
        if self.database.command.is_empty() {
            return Err(BackupError::config("database.command must not be empty"));
        }
        if self.database.compression_level > 9 {
            return Err(BackupError::config("database.compression_level must be between 0 and 9"));
        }
        if self.filesystem.paths.is_empty() {
            return Err(BackupError::config("filesystem.paths must list at least one path"));
        }
        if self.upload.retry.max_attempts == 0 {
            return Err(BackupError::config("upload.retry.max_attempts must be at least 1"));
        }
        if self.schedule.interval_hours == 0 {
            return Err(BackupError::config("schedule.interval_hours must be at least 1"));
        }

        let mut names = BTreeSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(BackupError::config("target names must not be empty"));
            }
            if !names.insert(target.name.as_str()) {
                return Err(BackupError::config(format!("duplicate target name '{}'", target.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil;
