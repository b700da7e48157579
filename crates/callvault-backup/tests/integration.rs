//! Integration tests for callvault backup runs
//!
//! Every scenario drives the public pipeline with in-memory producers and
//! remote targets so chain, upload and retention behaviour can be checked
//! end to end without external tools.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use callvault_backup::{
    chain::{validate_lineage, Chain, ChainTracker},
    producer::{DumpProducer, FilesystemSnapshotter, ProducedArtifact, SnapshotRequest},
    remote::{RemoteFile, RemoteReceipt, RemoteTarget},
    set_manager::{BackupSetManager, SetFilter, StagedSet},
    utils::BackupLayout,
    verify::IntegrityVerifier,
    ArtifactRole, BackupError, BackupJob, BackupKind, BackupResult, BackupSet, CallvaultConfig, Catalog,
    RemoteError, RetryPolicy, RunContext, RunStatus, SetId, SnapshotError, UploadStatus,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::tempdir;

#[derive(Debug, Default)]
struct StubDump;

#[async_trait]
impl DumpProducer for StubDump {
    async fn produce(&self, dest_dir: &Path) -> BackupResult<ProducedArtifact> {
        let path = dest_dir.join("db-voipnow.sql.gz");
        tokio::fs::write(&path, format!("-- dump of {}", dest_dir.display())).await?;
        Ok(ProducedArtifact {
            path,
            role: ArtifactRole::Database,
        })
    }
}

/// Writes an archive plus an index; can refuse the next incremental
#[derive(Debug, Default)]
struct StubSnapshotter {
    cannot_diff_next: AtomicBool,
    requests: Mutex<Vec<BackupKind>>,
}

#[async_trait]
impl FilesystemSnapshotter for StubSnapshotter {
    async fn snapshot(&self, request: SnapshotRequest<'_>) -> Result<Vec<ProducedArtifact>, SnapshotError> {
        self.requests.lock().unwrap().push(request.kind);
        if request.kind == BackupKind::Incremental && self.cannot_diff_next.swap(false, Ordering::SeqCst) {
            return Err(SnapshotError::CannotDiff("files.snar of reference set is corrupt".into()));
        }

        let archive = request.dest_dir.join("files.tar.gz");
        let index = request.dest_dir.join("files.snar");
        let write = |path: PathBuf, body: String| async move {
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| SnapshotError::Failed(e.to_string()))
                .map(|_| path)
        };
        Ok(vec![
            ProducedArtifact {
                path: write(archive, format!("{} archive", request.kind)).await?,
                role: ArtifactRole::Filesystem,
            },
            ProducedArtifact {
                path: write(index, "snar".into()).await?,
                role: ArtifactRole::SnapshotIndex,
            },
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Healthy,
    TimingOut,
    Slow,
}

/// In-memory remote store with switchable health
#[derive(Debug)]
struct StubTarget {
    name: String,
    health: Mutex<Health>,
    sets: Mutex<BTreeMap<SetId, Vec<RemoteFile>>>,
    uploads: AtomicU32,
}

impl StubTarget {
    fn new(name: &str, health: Health) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            health: Mutex::new(health),
            sets: Mutex::new(BTreeMap::new()),
            uploads: AtomicU32::new(0),
        })
    }

    fn set_health(&self, health: Health) {
        *self.health.lock().unwrap() = health;
    }

    fn stored(&self) -> Vec<SetId> {
        self.sets.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl RemoteTarget for StubTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let health = *self.health.lock().unwrap();
        match health {
            Health::TimingOut => return Err(RemoteError::Transient("connection timed out".into())),
            Health::Slow => tokio::time::sleep(StdDuration::from_secs(30)).await,
            Health::Healthy => {}
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(local_dir).map_err(|e| RemoteError::from_io(&e))? {
            let entry = entry.map_err(|e| RemoteError::from_io(&e))?;
            let len = entry.metadata().map_err(|e| RemoteError::from_io(&e))?.len();
            files.push(RemoteFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: Some(len),
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
        self.sets.lock().unwrap().remove(set_id);
        Ok(())
    }
}

/// Manually advanced clock shared with the job
#[derive(Debug, Clone)]
struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    fn at(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }

    fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

fn config(dir: &Path, history_depth: u32) -> CallvaultConfig {
    let mut config = CallvaultConfig::default();
    config.backup.dir = dir.to_path_buf();
    config.backup.history_depth = history_depth;
    config.backup.min_free_space_mb = 0;
    config.upload.op_timeout_secs = 5;
    config.upload.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        total_budget_secs: 20,
    };
    config
}

fn job_with(
    config: CallvaultConfig,
    snapshotter: Arc<StubSnapshotter>,
    targets: Vec<Arc<dyn RemoteTarget>>,
    clock: &TestClock,
) -> BackupJob {
    let clock = clock.clone();
    BackupJob::new(RunContext::new(config), Arc::new(StubDump), snapshotter, targets).with_clock(move || clock.now())
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap()
}

async fn catalog_of(job: &BackupJob) -> Catalog {
    job.context().load_catalog().await.unwrap()
}

async fn sequences(job: &BackupJob) -> Vec<u32> {
    job.sets().await.unwrap().iter().map(|s| s.sequence).collect()
}

#[test_log::test(tokio::test)]
async fn depth_three_resets_after_two_incrementals() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let job = job_with(config(temp.path(), 3), Arc::default(), vec![], &clock);

    for _ in 0..6 {
        let report = job.run().await;
        assert_eq!(report.status, RunStatus::Success, "{:?}", report.error);
        clock.advance(Duration::hours(1));
    }

    assert_eq!(sequences(&job).await, vec![0, 1, 2, 0, 1, 2]);
    let sets = job.sets().await.unwrap();
    assert_eq!(sets[3].kind, BackupKind::Full);
    assert_eq!(sets[3].chain_id, sets[3].id);
    assert_eq!(sets[4].chain_id, sets[3].id);
    assert!(validate_lineage(&catalog_of(&job).await).is_empty());
}

#[tokio::test]
async fn depth_two_alternates_full_and_incremental() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let job = job_with(config(temp.path(), 2), Arc::default(), vec![], &clock);

    for _ in 0..3 {
        job.run().await;
        clock.advance(Duration::hours(1));
    }

    let kinds: Vec<BackupKind> = job.sets().await.unwrap().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![BackupKind::Full, BackupKind::Incremental, BackupKind::Full]);
    assert_eq!(sequences(&job).await, vec![0, 1, 0]);
}

#[tokio::test]
async fn cannot_diff_starts_a_new_chain() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let snapshotter = Arc::new(StubSnapshotter::default());
    let job = job_with(config(temp.path(), 7), snapshotter.clone(), vec![], &clock);

    job.run().await;
    clock.advance(Duration::hours(1));
    job.run().await;
    clock.advance(Duration::hours(1));

    snapshotter.cannot_diff_next.store(true, Ordering::SeqCst);
    let report = job.run().await;
    assert_eq!(report.status, RunStatus::Success, "{:?}", report.error);

    let first_chain = job.sets().await.unwrap()[0].chain_id.clone();
    let (abandoned, _) = report.abandoned_chain.clone().unwrap();
    assert_eq!(abandoned, first_chain);

    let set = report.set.unwrap();
    assert_eq!(set.kind, BackupKind::Full);
    assert_eq!(set.sequence, 0);
    assert_ne!(set.chain_id, first_chain);
    assert_eq!(
        *snapshotter.requests.lock().unwrap(),
        vec![BackupKind::Full, BackupKind::Incremental, BackupKind::Incremental, BackupKind::Full]
    );

    // The abandoned chain is never extended again
    clock.advance(Duration::hours(1));
    let next = job.run().await.set.unwrap();
    assert_eq!(next.chain_id, set.id);
    assert_eq!(next.sequence, 1);
    assert!(catalog_of(&job).await.abandoned_reason(&first_chain).is_some());
}

#[test_log::test(tokio::test)]
async fn timing_out_target_leaves_pending_and_is_retried_next_run() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let a = StubTarget::new("a", Health::Healthy);
    let b = StubTarget::new("b", Health::TimingOut);
    let job = job_with(
        config(temp.path(), 7),
        Arc::default(),
        vec![a.clone(), b.clone()],
        &clock,
    );

    let report = job.run().await;
    assert_eq!(report.status, RunStatus::PartialSuccess);
    let first = report.set.unwrap().id;
    let sets = job.sets().await.unwrap();
    assert_eq!(sets[0].upload_status("a"), Some(UploadStatus::Done));
    assert_eq!(sets[0].upload_status("b"), Some(UploadStatus::Pending));
    assert_eq!(b.uploads.load(Ordering::SeqCst), 3);

    b.set_health(Health::Healthy);
    clock.advance(Duration::hours(1));
    let report = job.run().await;
    assert_eq!(report.status, RunStatus::Success, "{:?}", report.uploads);

    let second = report.set.unwrap().id;
    assert_eq!(b.stored(), vec![first.clone(), second.clone()]);
    for set in job.sets().await.unwrap() {
        assert_eq!(set.upload_status("a"), Some(UploadStatus::Done));
        assert_eq!(set.upload_status("b"), Some(UploadStatus::Done));
    }
}

#[tokio::test]
async fn checksum_mismatch_leaves_catalog_unchanged() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let job = job_with(config(temp.path(), 7), Arc::default(), vec![], &clock);
    job.run().await;
    clock.advance(Duration::hours(1));

    let layout = BackupLayout::new(temp.path());
    let mut catalog = catalog_of(&job).await;
    let before = job.sets().await.unwrap();

    // Produce the incremental by hand and corrupt it between seal and commit
    let (id, created_at) = catalog.next_id(clock.now());
    let next = ChainTracker::new(7).decide_next(&catalog, &id);
    assert_eq!(next.sequence, 1);
    let manager = BackupSetManager::new(layout.clone(), vec![]);
    let dir = manager.stage(&id).await.unwrap();
    let db = StubDump.produce(&dir).await.unwrap();
    let mut artifacts = vec![IntegrityVerifier::seal(&db.path, db.role).await.unwrap()];
    for produced in StubSnapshotter::default()
        .snapshot(SnapshotRequest {
            kind: next.kind,
            dest_dir: &dir,
            reference_dir: None,
        })
        .await
        .unwrap()
    {
        artifacts.push(IntegrityVerifier::seal(&produced.path, produced.role).await.unwrap());
    }
    tokio::fs::write(dir.join("files.tar.gz"), b"flipped bits").await.unwrap();

    let err = manager
        .commit(
            &mut catalog,
            StagedSet {
                id,
                created_at,
                kind: next.kind,
                chain_id: next.chain_id.clone(),
                sequence: next.sequence,
                dir: dir.clone(),
                artifacts,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::VerificationFailed { .. }));
    assert!(!dir.exists());
    assert_eq!(job.sets().await.unwrap(), before);

    // The next run produces the same sequence in the same chain
    let report = job.run().await;
    let set = report.set.unwrap();
    assert_eq!(set.sequence, 1);
    assert_eq!(set.chain_id, next.chain_id);
}

#[tokio::test]
async fn chain_with_recent_incremental_survives_retention() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let mut config = config(temp.path(), 7);
    config.retention.max_age_days = 14;
    let job = job_with(config, Arc::default(), vec![], &clock);

    job.run().await; // Full, 20 days before "now"
    clock.advance(Duration::days(15));
    job.run().await; // incremental, 5 days before "now"
    clock.advance(Duration::days(5));

    let report = job.cleanup().await.unwrap();
    assert!(report.deleted_local.is_empty());
    let sets = job.sets().await.unwrap();
    assert_eq!(sets.len(), 2);
    assert!(sets.iter().all(|s| s.locally_present));
}

#[test_log::test(tokio::test)]
async fn daily_runs_never_leave_partial_chains() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let mut config = config(temp.path(), 3);
    config.retention.max_age_days = 7;
    let nas = StubTarget::new("nas", Health::Healthy);
    let job = job_with(config, Arc::default(), vec![nas.clone()], &clock);

    for day in 0..30 {
        let report = job.run().await;
        assert_ne!(report.status, RunStatus::Failure, "day {day}: {:?}", report.error);

        let catalog = catalog_of(&job).await;
        assert!(validate_lineage(&catalog).is_empty());
        let chains = Chain::all(&catalog);
        assert!(chains.iter().any(Chain::is_restorable), "day {day}: no restorable chain");
        for chain in &chains {
            assert!(
                chain.is_restorable() || chain.is_purged(),
                "day {day}: chain {} is partially deleted",
                chain.id
            );
        }
        clock.advance(Duration::days(1));
    }

    // Old chains are gone locally and remotely; recent ones are intact
    let catalog = catalog_of(&job).await;
    let cutoff = clock.now() - Duration::days(7 + 3);
    let stored = nas.stored();
    for set in catalog.sets().filter(|s| s.created_at < cutoff) {
        assert!(!set.locally_present);
        assert_eq!(set.upload_status("nas"), Some(UploadStatus::Pruned));
        assert!(!stored.contains(&set.id));
    }
}

#[tokio::test]
async fn cancelled_upload_stays_pending() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let slow = StubTarget::new("slow", Health::Slow);
    let job = Arc::new(job_with(config(temp.path(), 7), Arc::default(), vec![slow.clone()], &clock));

    let cancel = job.cancel_token();
    let running = tokio::spawn({
        let job = job.clone();
        async move { job.run().await }
    });
    while slow.uploads.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    cancel.cancel();

    let report = running.await.unwrap();
    assert_eq!(report.status, RunStatus::PartialSuccess);
    assert!(report.cleanup.is_none());
    let sets = job.sets().await.unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].upload_status("slow"), Some(UploadStatus::Pending));
}

#[tokio::test]
async fn verification_is_idempotent_and_flags_bit_rot() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let job = job_with(config(temp.path(), 7), Arc::default(), vec![], &clock);
    job.run().await;
    clock.advance(Duration::hours(1));
    job.run().await;

    let first = job.verify().await.unwrap();
    let second = job.verify().await.unwrap();
    assert_eq!(first, second);
    assert!(first.iter().all(|v| v.passed()));

    let sets: Vec<BackupSet> = job.sets().await.unwrap();
    let head = &sets[1];
    let layout = BackupLayout::new(temp.path());
    tokio::fs::write(layout.set_dir(&head.id).join("files.tar.gz"), b"rot")
        .await
        .unwrap();
    let results = job.verify().await.unwrap();
    assert!(!results[1].passed());

    // An unverified head abandons its chain
    clock.advance(Duration::hours(1));
    let set = job.run().await.set.unwrap();
    assert_eq!(set.kind, BackupKind::Full);
    assert_ne!(set.chain_id, head.chain_id);
}

#[tokio::test]
async fn list_filters_by_chain() {
    let temp = tempdir().unwrap();
    let clock = TestClock::at(start());
    let job = job_with(config(temp.path(), 2), Arc::default(), vec![], &clock);
    for _ in 0..4 {
        job.run().await;
        clock.advance(Duration::hours(1));
    }

    let catalog = catalog_of(&job).await;
    let manager = BackupSetManager::new(BackupLayout::new(temp.path()), vec![]);
    let chain_ids = catalog.chain_ids();
    assert_eq!(chain_ids.len(), 2);
    let second = manager.list(&catalog, &SetFilter::chain(chain_ids[1].clone()));
    assert_eq!(second.iter().map(|s| s.sequence).collect::<Vec<_>>(), vec![0, 1]);
    assert!(second.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn test_invalid_backup_dir() {
    let clock = TestClock::at(start());
    let job = job_with(
        config(Path::new("/proc/callvault-cannot-exist"), 7),
        Arc::default(),
        vec![],
        &clock,
    );

    let report = job.run().await;
    assert_eq!(report.status, RunStatus::Failure);
    assert!(report.error.is_some());
}
