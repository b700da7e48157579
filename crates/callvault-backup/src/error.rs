//! Error types for callvault backup operations
//!
//! `BackupError` is the run-level taxonomy. Transport and production
//! failures carry their own small enums so the pipeline can tell a
//! recoverable condition (transient upload, cannot-diff) from a fatal one.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{io, path::PathBuf};
use thiserror::Error;

use crate::{model::SetId, verify::ArtifactCheck};

fn failed_names(checks: &[ArtifactCheck]) -> String {
    checks
        .iter()
        .filter(|c| !c.matches)
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Main error type for backup operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// The database dump could not be produced
    #[error("Database dump failed: {0}")]
    DumpFailed(String),

    /// The filesystem snapshot could not be produced
    #[error("Filesystem snapshot failed: {0}")]
    SnapshotFailed(String),

    /// A chain can no longer be extended; recovered by forcing a Full
    #[error("Chain {chain_id} abandoned: {reason}")]
    ChainAbandoned {
        /// Chain that was abandoned
        chain_id: SetId,
        /// Why it was abandoned
        reason: String,
    },

    /// One or more artifacts did not match their close-time checksum
    #[error("Verification failed for set {set_id}: {}", failed_names(.checks))]
    VerificationFailed {
        /// Set that was discarded
        set_id: SetId,
        /// Per-artifact results, including the ones that passed
        checks: Vec<ArtifactCheck>,
    },

    /// Upload to a remote target failed
    #[error("Upload of {set_id} to {target} failed: {source}")]
    UploadFailed {
        /// Remote target name
        target: String,
        /// Set that was being uploaded
        set_id: SetId,
        /// Underlying transport error
        #[source]
        source: RemoteError,
    },

    /// Some cleanup actions failed; the rest were applied
    #[error("Cleanup partially failed ({0} actions)")]
    CleanupPartialFailure(usize),

    /// Not enough free space on the backup destination
    #[error("Insufficient free space on {}: {available} bytes available, {required} required", .path.display())]
    SpacePreflightFailed {
        /// Destination checked
        path: PathBuf,
        /// Bytes available
        available: u64,
        /// Bytes required
        required: u64,
    },

    /// Another run holds the run lock
    #[error("Another backup run holds the lock: {0}")]
    Locked(String),

    /// The run was cancelled before the set was committed
    #[error("Backup run cancelled")]
    Cancelled,

    /// Catalog could not be read or written
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error during backup operation
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

}

/// Result type for backup operations
pub type BackupResult<T> = Result<T, BackupError>;

/// Failure reported by a remote target
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Worth retrying: connection reset, timeout, temporary unavailability
    #[error("transient: {0}")]
    Transient(String),

    /// Not worth retrying: auth rejected, quota exceeded, tool missing
    #[error("permanent: {0}")]
    Permanent(String),
}

impl RemoteError {
    /// Whether the failure may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The message without its classification
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }

    /// Classify an I/O error from a transport
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Self::Transient(err.to_string()),
            _ => Self::Permanent(err.to_string()),
        }
    }
}

/// Failure reported by the filesystem snapshotter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The reference point of the prior set is unusable; the chain must be abandoned
    #[error("cannot diff against reference: {0}")]
    CannotDiff(String),

    /// The snapshot itself failed
    #[error("{0}")]
    Failed(String),
}
