//! Shared fixtures for unit tests

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::{
    error::{BackupError, BackupResult, RemoteError, SnapshotError},
    model::{Artifact, ArtifactRole, BackupKind, BackupSet, SetId},
    producer::{DumpProducer, FilesystemSnapshotter, ProducedArtifact, SnapshotRequest},
    remote::{RemoteFile, RemoteReceipt, RemoteTarget},
    utils::BackupLayout,
    CallvaultConfig, RetryPolicy,
};

fn content(id: &SetId, name: &str) -> Vec<u8> {
    format!("{id}:{name}").into_bytes()
}

/// Verified, locally present set created at `ts`; a Full when `chain` is `None`
pub(crate) fn set_at(ts: DateTime<Utc>, chain: Option<&SetId>, sequence: u32) -> BackupSet {
    let id = SetId::from_timestamp(ts);
    let artifacts = [("db-voipnow.sql.gz", ArtifactRole::Database), ("files.tar.gz", ArtifactRole::Filesystem)]
        .into_iter()
        .map(|(name, role)| {
            let bytes = content(&id, name);
            Artifact {
                name: name.to_string(),
                role,
                size_bytes: bytes.len() as u64,
                checksum: format!("{:x}", Sha256::digest(&bytes)),
            }
        })
        .collect();
    BackupSet {
        chain_id: chain.cloned().unwrap_or_else(|| id.clone()),
        id,
        kind: if sequence == 0 { BackupKind::Full } else { BackupKind::Incremental },
        sequence,
        created_at: ts,
        artifacts,
        verified: true,
        uploaded: BTreeMap::new(),
        locally_present: true,
    }
}

/// Write the artifacts `set_at` describes into the set directory
pub(crate) async fn write_artifacts(layout: &BackupLayout, set: &BackupSet) {
    let dir = layout.set_dir(&set.id);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    for artifact in &set.artifacts {
        tokio::fs::write(dir.join(&artifact.name), content(&set.id, &artifact.name))
            .await
            .unwrap();
    }
}

/// Configuration rooted at `dir` with fast retries and no space floor
pub(crate) fn test_config(dir: &Path) -> CallvaultConfig {
    let mut config = CallvaultConfig::default();
    config.backup.dir = dir.to_path_buf();
    config.backup.min_free_space_mb = 0;
    config.backup.history_depth = 3;
    config.upload.retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        total_budget_secs: 10,
    };
    config.upload.op_timeout_secs = 5;
    config
}

/// In-memory remote target
#[derive(Debug, Default)]
pub(crate) struct MemoryTarget {
    name: String,
    sets: Mutex<BTreeMap<SetId, Vec<RemoteFile>>>,
    upload_error: Mutex<Option<RemoteError>>,
    delete_error: Mutex<Option<RemoteError>>,
    uploads: AtomicU32,
}

impl MemoryTarget {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn fail_uploads_with(&self, error: RemoteError) {
        *self.upload_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_deletes_with(&self, error: RemoteError) {
        *self.delete_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn seed(&self, id: &SetId) {
        self.sets.lock().unwrap().insert(id.clone(), Vec::new());
    }

    pub(crate) fn stored(&self) -> Vec<SetId> {
        self.sets.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn upload_calls(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTarget for MemoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.upload_error.lock().unwrap().clone() {
            return Err(error);
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(local_dir).map_err(|e| RemoteError::from_io(&e))? {
            let entry = entry.map_err(|e| RemoteError::from_io(&e))?;
            files.push(RemoteFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: Some(entry.metadata().map_err(|e| RemoteError::from_io(&e))?.len()),
            });
        }
        self.sets.lock().unwrap().insert(set_id.clone(), files.clone());
        Ok(RemoteReceipt {
            set_id: set_id.clone(),
            files,
        })
    }

    async fn list(&self) -> Result<Vec<SetId>, RemoteError> {
        Ok(self.stored())
    }

    async fn delete(&self, set_id: &SetId) -> Result<(), RemoteError> {
        if let Some(error) = self.delete_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.sets.lock().unwrap().remove(set_id);
        Ok(())
    }
}

/// Dump producer writing a fixed payload
#[derive(Debug, Default)]
pub(crate) struct FakeDump {
    fail: bool,
}

impl FakeDump {
    pub(crate) fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl DumpProducer for FakeDump {
    async fn produce(&self, dest_dir: &Path) -> BackupResult<ProducedArtifact> {
        if self.fail {
            return Err(BackupError::DumpFailed("simulated mysqldump exit 2".into()));
        }
        let path = dest_dir.join("db-voipnow.sql.gz");
        tokio::fs::write(&path, b"-- dump").await?;
        Ok(ProducedArtifact {
            path,
            role: ArtifactRole::Database,
        })
    }
}

/// Snapshotter writing an archive and an index
#[derive(Debug, Default)]
pub(crate) struct FakeSnapshotter;

#[async_trait]
impl FilesystemSnapshotter for FakeSnapshotter {
    async fn snapshot(&self, request: SnapshotRequest<'_>) -> Result<Vec<ProducedArtifact>, SnapshotError> {
        let archive = request.dest_dir.join("files.tar.gz");
        tokio::fs::write(&archive, request.kind.to_string())
            .await
            .map_err(|e| SnapshotError::Failed(e.to_string()))?;
        Ok(vec![ProducedArtifact {
            path: archive,
            role: ArtifactRole::Filesystem,
        }])
    }
}
