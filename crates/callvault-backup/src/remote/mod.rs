//! Remote mirroring of committed backup sets
//!
//! Every transport implements [`RemoteTarget`] (upload, list, delete). The
//! sync engine below is written once against that trait: it retries per
//! (set, target), confirms receipts before marking a set `Done`, and runs
//! distinct targets concurrently with a bounded worker count.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

pub mod ftp;
pub mod local;
pub mod retry;
pub mod s3;
pub mod scp;
mod tool;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    catalog::Catalog,
    chain::Chain,
    error::{BackupError, RemoteError},
    model::{BackupSet, SetId, UploadStatus},
    utils::BackupLayout,
    TargetConfig, TransportConfig, UploadConfig,
};

pub use retry::{RetryOutcome, RetryPolicy};

/// A file as seen on the remote after upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// File name inside the remote set directory
    pub name: String,
    /// Size reported by the remote, when the transport can tell
    pub size_bytes: Option<u64>,
}

/// What the remote reports it stored for a set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReceipt {
    /// Remote set identifier
    pub set_id: SetId,
    /// Files found under it
    pub files: Vec<RemoteFile>,
}

/// Capability set every remote store implements
#[async_trait]
pub trait RemoteTarget: Send + Sync + fmt::Debug {
    /// Target name used as key in `BackupSet::uploaded`
    fn name(&self) -> &str;

    /// Send the contents of `local_dir` as remote set `set_id`
    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError>;

    /// Identifiers of the sets stored on the remote
    async fn list(&self) -> Result<Vec<SetId>, RemoteError>;

    /// Remove a remote set; removing an absent set succeeds
    async fn delete(&self, set_id: &SetId) -> Result<(), RemoteError>;
}

/// Build the transport for one configured target
pub fn build_target(config: &TargetConfig) -> Arc<dyn RemoteTarget> {
    let name = config.name.clone();
    match &config.transport {
        TransportConfig::Local { path } => Arc::new(local::LocalTarget::new(name, path.clone())),
        TransportConfig::Scp(opts) => Arc::new(scp::ScpTarget::new(name, opts.clone())),
        TransportConfig::Ftp(opts) => Arc::new(ftp::FtpTarget::new(name, opts.clone())),
        TransportConfig::S3(opts) => Arc::new(s3::S3Target::new(name, opts.clone())),
    }
}

/// Result of one (set, target) upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadResult {
    /// Receipt confirmed
    Done,
    /// Gave up for this run
    Failed {
        /// Last error
        reason: String,
        /// Whether the last error was transient
        transient: bool,
    },
    /// Not attempted because an earlier set already failed on this target
    Skipped,
    /// Aborted by cancellation
    Cancelled,
}

/// Upload outcome reported for a (set, target) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Target name
    pub target: String,
    /// Set uploaded
    pub set_id: SetId,
    /// Attempts made
    pub attempts: u32,
    /// Result
    pub result: UploadResult,
}

impl UploadOutcome {
    /// Catalog status this outcome leaves the set in for its target
    pub fn status(&self) -> UploadStatus {
        match &self.result {
            UploadResult::Done => UploadStatus::Done,
            UploadResult::Failed { transient: false, .. } => UploadStatus::Failed,
            _ => UploadStatus::Pending,
        }
    }

    /// The failure as a run-level error, when the upload gave up
    pub fn error(&self) -> Option<BackupError> {
        let UploadResult::Failed { reason, transient } = &self.result else {
            return None;
        };
        let source = if *transient {
            RemoteError::Transient(reason.clone())
        } else {
            RemoteError::Permanent(reason.clone())
        };
        Some(BackupError::UploadFailed {
            target: self.target.clone(),
            set_id: self.set_id.clone(),
            source,
        })
    }
}

fn confirm_receipt(set: &BackupSet, receipt: &RemoteReceipt) -> Result<(), RemoteError> {
    if receipt.set_id != set.id {
        return Err(RemoteError::Transient(format!(
            "receipt is for {} instead of {}",
            receipt.set_id, set.id
        )));
    }
    for artifact in &set.artifacts {
        let Some(file) = receipt.files.iter().find(|f| f.name == artifact.name) else {
            return Err(RemoteError::Transient(format!("{} missing on remote", artifact.name)));
        };
        if let Some(size) = file.size_bytes {
            if size != artifact.size_bytes {
                return Err(RemoteError::Transient(format!(
                    "{} is {} bytes on remote, expected {}",
                    artifact.name, size, artifact.size_bytes
                )));
            }
        }
    }
    Ok(())
}

async fn with_timeout<T>(
    op_timeout: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(op_timeout, fut)
        .await
        .unwrap_or_else(|_| Err(RemoteError::Transient(format!("{what} timed out after {:?}", op_timeout))))
}

/// Upload one set to one target with retries, confirming receipt and
/// listing before reporting `Done`.
async fn upload_with_retry(
    target: Arc<dyn RemoteTarget>,
    set: BackupSet,
    set_dir: PathBuf,
    policy: RetryPolicy,
    op_timeout: Duration,
    cancel: CancellationToken,
) -> UploadOutcome {
    let op_name = format!("upload {} to {}", set.id, target.name());
    let outcome = policy
        .run(&cancel, &op_name, || {
            let target = target.clone();
            let set = &set;
            let set_dir = &set_dir;
            async move {
                let receipt = with_timeout(op_timeout, "upload", target.upload(&set.id, set_dir)).await?;
                confirm_receipt(set, &receipt)?;
                let listed = with_timeout(op_timeout, "list", target.list()).await?;
                if !listed.contains(&set.id) {
                    return Err(RemoteError::Transient(format!("{} not listed after upload", set.id)));
                }
                Ok(())
            }
        })
        .await;

    let (attempts, result) = match outcome {
        RetryOutcome::Succeeded { attempts, .. } => {
            info!("☁️ Uploaded {} to {} ({} attempts)", set.id, target.name(), attempts);
            (attempts, UploadResult::Done)
        }
        RetryOutcome::GaveUp { error, attempts } => {
            error!("❌ Upload of {} to {} failed after {} attempts: {}", set.id, target.name(), attempts, error);
            (
                attempts,
                UploadResult::Failed {
                    transient: error.is_transient(),
                    reason: error.message().to_string(),
                },
            )
        }
        RetryOutcome::Cancelled { attempts } => {
            warn!("🚫 Upload of {} to {} cancelled", set.id, target.name());
            (attempts, UploadResult::Cancelled)
        }
    };

    UploadOutcome {
        target: target.name().to_string(),
        set_id: set.id,
        attempts,
        result,
    }
}

/// Uploads committed sets to every configured target
#[derive(Debug, Clone)]
pub struct RemoteSync {
    targets: Vec<Arc<dyn RemoteTarget>>,
    policy: RetryPolicy,
    max_concurrent: usize,
    op_timeout: Duration,
}

impl RemoteSync {
    /// Sync engine over already-built targets
    pub fn new(targets: Vec<Arc<dyn RemoteTarget>>, config: &UploadConfig) -> Self {
        Self {
            targets,
            policy: config.retry.clone(),
            max_concurrent: config.max_concurrent.max(1),
            op_timeout: Duration::from_secs(config.op_timeout_secs.max(1)),
        }
    }

    /// Sets that still need to reach `target`, oldest first. A set with no
    /// entry for `target` (the target was added after it was committed) is
    /// owed only when its whole chain is still complete locally, so the
    /// remote never receives an incremental without its Full.
    pub fn backlog(catalog: &Catalog, target: &str) -> Vec<BackupSet> {
        catalog
            .sets()
            .filter(|s| s.verified && s.locally_present)
            .filter(|s| match s.upload_status(target) {
                Some(status) => status.needs_upload(),
                None => Chain::from_catalog(catalog, &s.chain_id).is_locally_complete(),
            })
            .cloned()
            .collect()
    }

    /// Upload a single set to a single target
    pub async fn upload(
        &self,
        set: &BackupSet,
        set_dir: &Path,
        target: Arc<dyn RemoteTarget>,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        upload_with_retry(
            target,
            set.clone(),
            set_dir.to_path_buf(),
            self.policy.clone(),
            self.op_timeout,
            cancel.clone(),
        )
        .await
    }

    /// Upload each target's backlog. Targets run concurrently up to the
    /// worker limit; within a target sets go oldest first, and the first
    /// set that cannot be delivered ends that target's turn.
    #[instrument(skip_all)]
    pub async fn sync(
        &self,
        catalog: &Catalog,
        layout: &BackupLayout,
        cancel: &CancellationToken,
    ) -> Vec<UploadOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for target in &self.targets {
            let backlog = Self::backlog(catalog, target.name());
            if backlog.is_empty() {
                continue;
            }
            info!("📤 {} set(s) pending for target {}", backlog.len(), target.name());

            let target = target.clone();
            let semaphore = semaphore.clone();
            let layout = layout.clone();
            let sync = self.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let mut outcomes = Vec::with_capacity(backlog.len());
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return outcomes;
                };

                let mut blocked = false;
                for set in backlog {
                    if blocked || cancel.is_cancelled() {
                        outcomes.push(UploadOutcome {
                            target: target.name().to_string(),
                            set_id: set.id,
                            attempts: 0,
                            result: if blocked { UploadResult::Skipped } else { UploadResult::Cancelled },
                        });
                        continue;
                    }
                    let outcome = sync.upload(&set, &layout.set_dir(&set.id), target.clone(), &cancel).await;
                    blocked = outcome.result != UploadResult::Done;
                    outcomes.push(outcome);
                }
                outcomes
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mut batch) => outcomes.append(&mut batch),
                Err(e) => error!("❌ Upload worker panicked: {}", e),
            }
        }
        outcomes.sort_by(|a, b| a.set_id.cmp(&b.set_id).then_with(|| a.target.cmp(&b.target)));
        outcomes
    }

    /// Record upload outcomes in the catalog. A set already `Done` on a
    /// target is never downgraded.
    pub fn apply(catalog: &mut Catalog, outcomes: &[UploadOutcome]) {
        for outcome in outcomes {
            let Some(set) = catalog.get_mut(&outcome.set_id) else {
                continue;
            };
            let entry = set
                .uploaded
                .entry(outcome.target.clone())
                .or_insert(UploadStatus::Pending);
            if *entry != UploadStatus::Done {
                *entry = outcome.status();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{set_at, MemoryTarget};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn quick_config() -> UploadConfig {
        UploadConfig {
            max_concurrent: 2,
            op_timeout_secs: 5,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                total_budget_secs: 10,
            },
        }
    }

    #[test]
    fn receipt_must_cover_every_artifact() {
        let set = set_at(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(), None, 0);
        let mut receipt = RemoteReceipt {
            set_id: set.id.clone(),
            files: set
                .artifacts
                .iter()
                .map(|a| RemoteFile {
                    name: a.name.clone(),
                    size_bytes: Some(a.size_bytes),
                })
                .collect(),
        };
        assert!(confirm_receipt(&set, &receipt).is_ok());

        receipt.files[0].size_bytes = Some(1);
        assert!(confirm_receipt(&set, &receipt).is_err());

        receipt.files.remove(0);
        assert!(confirm_receipt(&set, &receipt).is_err());
    }

    #[tokio::test]
    async fn failing_target_blocks_only_itself() {
        let temp = tempdir().unwrap();
        let layout = BackupLayout::new(temp.path());
        let mut catalog = Catalog::new(layout.catalog_path());

        let mut set = set_at(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(), None, 0);
        set.uploaded.insert("good".into(), UploadStatus::Pending);
        set.uploaded.insert("bad".into(), UploadStatus::Pending);
        crate::testutil::write_artifacts(&layout, &set).await;
        catalog.insert(set.clone());

        let good = Arc::new(MemoryTarget::new("good"));
        let bad = Arc::new(MemoryTarget::new("bad"));
        bad.fail_uploads_with(RemoteError::Transient("timeout".into()));

        let sync = RemoteSync::new(vec![good.clone(), bad.clone()], &quick_config());
        let outcomes = sync.sync(&catalog, &layout, &CancellationToken::new()).await;
        RemoteSync::apply(&mut catalog, &outcomes);

        let stored = catalog.get(&set.id).unwrap();
        assert_eq!(stored.upload_status("good"), Some(UploadStatus::Done));
        assert_eq!(stored.upload_status("bad"), Some(UploadStatus::Pending));
        assert_eq!(bad.upload_calls(), 2);
        assert_eq!(RemoteSync::backlog(&catalog, "bad").len(), 1);
        assert!(RemoteSync::backlog(&catalog, "good").is_empty());
    }

    #[tokio::test]
    async fn single_upload_is_confirmed() {
        let temp = tempdir().unwrap();
        let layout = BackupLayout::new(temp.path());
        let set = set_at(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(), None, 0);
        crate::testutil::write_artifacts(&layout, &set).await;

        let nas = Arc::new(MemoryTarget::new("nas"));
        let sync = RemoteSync::new(vec![nas.clone()], &quick_config());
        let outcome = sync
            .upload(&set, &layout.set_dir(&set.id), nas.clone(), &CancellationToken::new())
            .await;

        assert_eq!(outcome.result, UploadResult::Done);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error().is_none());
        assert_eq!(nas.stored(), vec![set.id]);
    }

    #[test]
    fn new_target_is_owed_whole_local_chains() {
        let t0 = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let mut catalog = Catalog::new("/nonexistent/catalog.json");

        let full = set_at(t0, None, 0);
        let incr = set_at(t0 + chrono::Duration::days(1), Some(&full.id), 1);
        let mut old_full = set_at(t0 - chrono::Duration::days(30), None, 0);
        old_full.locally_present = false;
        old_full.uploaded.insert("nas".into(), UploadStatus::Done);
        let old_incr = set_at(t0 - chrono::Duration::days(29), Some(&old_full.id), 1);
        for set in [&full, &incr, &old_full, &old_incr] {
            catalog.insert(set.clone());
        }

        let ids: Vec<SetId> = RemoteSync::backlog(&catalog, "nas").into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![full.id, incr.id]);
    }

    #[tokio::test]
    async fn permanent_failure_is_recorded_as_failed() {
        let temp = tempdir().unwrap();
        let layout = BackupLayout::new(temp.path());
        let mut catalog = Catalog::new(layout.catalog_path());

        let mut set = set_at(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(), None, 0);
        set.uploaded.insert("quota".into(), UploadStatus::Pending);
        crate::testutil::write_artifacts(&layout, &set).await;
        catalog.insert(set.clone());

        let quota = Arc::new(MemoryTarget::new("quota"));
        quota.fail_uploads_with(RemoteError::Permanent("quota exceeded".into()));

        let sync = RemoteSync::new(vec![quota.clone()], &quick_config());
        let outcomes = sync.sync(&catalog, &layout, &CancellationToken::new()).await;
        RemoteSync::apply(&mut catalog, &outcomes);

        assert_eq!(quota.upload_calls(), 1);
        assert!(matches!(
            outcomes[0].error(),
            Some(BackupError::UploadFailed { source: RemoteError::Permanent(ref msg), .. }) if msg == "quota exceeded"
        ));
        assert_eq!(
            catalog.get(&set.id).unwrap().upload_status("quota"),
            Some(UploadStatus::Failed)
        );
        // Failed sets stay in the backlog for the next run
        assert_eq!(RemoteSync::backlog(&catalog, "quota").len(), 1);
    }
}
