//! Backup set records
//!
//! A `BackupSet` is the durable record of one backup event. Sets are
//! grouped into chains by `chain_id`; the Full set of a chain carries its
//! own id as `chain_id` and sequence 0.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp-derived, lexicographically sortable set identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetId(String);

impl SetId {
    /// Format used for ids; sorts the same way as the timestamps it encodes
    pub const FORMAT: &'static str = "%Y%m%dT%H%M%S%.3fZ";

    /// Build an id from a creation timestamp
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.format(Self::FORMAT).to_string())
    }

    /// String form, also used as directory name locally and remotely
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backup kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Self-contained base of a chain
    Full,
    /// Delta against the previous set of the same chain
    Incremental,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Incremental => f.write_str("incremental"),
        }
    }
}

/// What an artifact holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactRole {
    /// Database dump
    Database,
    /// Filesystem archive (full or delta)
    Filesystem,
    /// Snapshot state needed to diff the next incremental
    SnapshotIndex,
}

/// One file of a backup set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name inside the set directory
    pub name: String,
    /// Artifact role
    pub role: ArtifactRole,
    /// Size at close time
    pub size_bytes: u64,
    /// Hex SHA-256 taken at close time
    pub checksum: String,
}

/// Per-target upload state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Not yet confirmed; retried by the next run
    Pending,
    /// Remote confirmed receipt
    Done,
    /// Last attempt failed permanently; still retried by the next run
    Failed,
    /// Removed from the target by retention
    Pruned,
}

impl UploadStatus {
    /// Whether the set still needs to be sent to the target
    pub fn needs_upload(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// Durable record of one backup event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSet {
    /// Set id
    pub id: SetId,
    /// Full or incremental
    pub kind: BackupKind,
    /// Id of the Full set that started this lineage
    pub chain_id: SetId,
    /// Position within the chain; 0 for the Full
    pub sequence: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Artifacts in production order
    pub artifacts: Vec<Artifact>,
    /// True once every artifact matched its close-time checksum
    pub verified: bool,
    /// Upload state per remote target name
    pub uploaded: BTreeMap<String, UploadStatus>,
    /// False once local retention removed the artifacts
    pub locally_present: bool,
}

impl BackupSet {
    /// Total size of all artifacts
    pub fn total_size(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size_bytes).sum()
    }

    /// Whether at least one remote confirmed receipt
    pub fn is_remotely_present(&self) -> bool {
        self.uploaded.values().any(|s| *s == UploadStatus::Done)
    }

    /// Present locally or on any remote
    pub fn is_present(&self) -> bool {
        self.locally_present || self.is_remotely_present()
    }

    /// Upload status for a target; targets never recorded count as absent
    pub fn upload_status(&self, target: &str) -> Option<UploadStatus> {
        self.uploaded.get(target).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn set_ids_sort_chronologically() {
        let a = SetId::from_timestamp(Utc.with_ymd_and_hms(2025, 1, 9, 23, 0, 0).unwrap());
        let b = SetId::from_timestamp(Utc.with_ymd_and_hms(2025, 1, 10, 1, 0, 0).unwrap());
        assert!(a < b);
        assert_eq!(a.as_str(), "20250109T230000.000Z");
    }

    #[test]
    fn failed_uploads_are_retried_but_pruned_are_not() {
        assert!(UploadStatus::Pending.needs_upload());
        assert!(UploadStatus::Failed.needs_upload());
        assert!(!UploadStatus::Done.needs_upload());
        assert!(!UploadStatus::Pruned.needs_upload());
    }
}
