//! The backup pipeline
//!
//! One run: lock, recover, preflight, decide, produce and seal, commit,
//! upload, clean up, notify. Every stage hands a typed result to the next;
//! the only state that survives the run is the catalog. Once a set is
//! committed, later failures are recorded on the report and never undo it.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    catalog::Catalog,
    chain::{AbandonReason, ChainTracker, DecisionReason, NextBackup},
    error::{BackupError, BackupResult, SnapshotError},
    lock::RunLock,
    model::{BackupSet, SetId},
    notify::{notify_all, CommandNotifier, LogNotifier, Notifier, RunReport, SetSummary},
    preflight,
    producer::{
        CommandDumpProducer, DumpProducer, FilesystemSnapshotter, ProducedArtifact, SnapshotRequest, TarSnapshotter,
    },
    remote::{build_target, RemoteSync, RemoteTarget, UploadOutcome},
    retention::{CleanupReport, RetentionEngine, RetentionPlan},
    set_manager::{BackupSetManager, StagedSet},
    utils::BackupLayout,
    verify::{verify_catalog, IntegrityVerifier, SealedArtifact, SetVerification},
    CallvaultConfig,
};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Everything a run needs besides its collaborators: configuration, the
/// on-disk layout and the cancellation token. Passed explicitly; nothing is
/// global.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Validated configuration
    pub config: CallvaultConfig,
    /// Backup destination layout
    pub layout: BackupLayout,
    /// Cancelled on shutdown
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Context for `config` with a fresh cancellation token
    pub fn new(config: CallvaultConfig) -> Self {
        let layout = BackupLayout::new(&config.backup.dir);
        Self {
            config,
            layout,
            cancel: CancellationToken::new(),
        }
    }

    /// Open the catalog
    pub async fn load_catalog(&self) -> BackupResult<Catalog> {
        Catalog::load(&self.layout.catalog_path()).await
    }
}

/// A backup job wired to its producers, targets and notifiers
pub struct BackupJob {
    ctx: RunContext,
    producer: Arc<dyn DumpProducer>,
    snapshotter: Arc<dyn FilesystemSnapshotter>,
    targets: Vec<Arc<dyn RemoteTarget>>,
    notifiers: Vec<Box<dyn Notifier>>,
    clock: Clock,
}

impl fmt::Debug for BackupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupJob")
            .field("backup_dir", &self.ctx.layout.root())
            .field("producer", &self.producer)
            .field("snapshotter", &self.snapshotter)
            .field("targets", &self.targets)
            .field("notifiers", &self.notifiers)
            .finish()
    }
}

impl BackupJob {
    /// Job with explicit collaborators and no notifiers
    pub fn new(
        ctx: RunContext,
        producer: Arc<dyn DumpProducer>,
        snapshotter: Arc<dyn FilesystemSnapshotter>,
        targets: Vec<Arc<dyn RemoteTarget>>,
    ) -> Self {
        Self {
            ctx,
            producer,
            snapshotter,
            targets,
            notifiers: Vec::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Job using the command-line producers and the configured targets
    pub fn from_config(ctx: RunContext) -> Self {
        let config = &ctx.config;
        let producer = Arc::new(CommandDumpProducer::new(config.database.clone()));
        let snapshotter = Arc::new(TarSnapshotter::new(config.filesystem.clone()));
        let targets = config.targets.iter().map(build_target).collect();
        let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
        if !config.notify.command.is_empty() {
            notifiers.push(Box::new(CommandNotifier::new(config.notify.clone())));
        }
        let mut job = Self::new(ctx, producer, snapshotter, targets);
        job.notifiers = notifiers;
        job
    }

    /// Add a notifier
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Run context
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Token that cancels this job's runs
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    fn retention(&self) -> RetentionEngine {
        RetentionEngine::new(self.ctx.config.retention.clone(), self.ctx.layout.clone())
    }

    fn check_cancelled(&self) -> BackupResult<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    /// Execute one backup run and deliver its report
    #[instrument(skip(self), fields(backup_dir = %self.ctx.layout.root().display()))]
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::begin();
        let result = self.execute(&mut report).await;
        let status = report.finish(result.as_ref().err());
        if let Err(e) = &result {
            error!("❌ Backup run failed: {}", e);
        }
        info!("🏁 Backup run {} finished: {}", report.run_id, status);
        notify_all(&self.notifiers, &report).await;
        report
    }

    async fn execute(&self, report: &mut RunReport) -> BackupResult<()> {
        let layout = &self.ctx.layout;
        let backup = &self.ctx.config.backup;

        layout.prepare()?;
        let _lock = RunLock::acquire(
            &layout.lock_path(),
            chrono::Duration::hours(i64::from(backup.lock_stale_hours)),
        )?;

        let mut catalog = self.ctx.load_catalog().await?;
        let target_names = self.targets.iter().map(|t| t.name().to_string()).collect();
        let manager = BackupSetManager::new(layout.clone(), target_names);
        report.recovered = manager.recover(&catalog).await?;
        self.check_cancelled()?;

        preflight::check_space(layout.root(), preflight::required_bytes(&catalog, backup.min_free_space_mb))?;

        let (id, created_at) = catalog.next_id((self.clock)());
        let next = ChainTracker::new(backup.history_depth).decide_next(&catalog, &id);
        if let DecisionReason::Abandoned { chain_id, reason } = &next.reason {
            report.abandoned_chain = Some((chain_id.clone(), reason.to_string()));
        }
        report.decision = Some(next.reason.clone());

        let dir = manager.stage(&id).await?;
        let produced = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(BackupError::Cancelled),
            res = self.produce(&mut catalog, next, &id, &dir, report) => res,
        };
        let (next, artifacts) = match produced.and_then(|p| {
            self.check_cancelled()?;
            Ok(p)
        }) {
            Ok(p) => p,
            Err(e) => {
                manager.discard(&dir).await;
                return Err(e);
            }
        };

        let staged = StagedSet {
            id,
            created_at,
            kind: next.kind,
            chain_id: next.chain_id,
            sequence: next.sequence,
            dir,
            artifacts,
        };
        let committed = match manager.commit(&mut catalog, staged).await {
            Ok(committed) => committed,
            Err(e) => {
                if let BackupError::VerificationFailed { checks, .. } = &e {
                    report.verification = checks.clone();
                }
                return Err(e);
            }
        };
        report.verification = committed.checks;
        report.set = Some(SetSummary::from(&committed.set));

        if let Err(e) = self.upload_backlog(&mut catalog, report).await {
            report.record_problem(&e);
        }

        if self.ctx.cancel.is_cancelled() {
            warn!("🚫 Run cancelled after commit, skipping cleanup");
            return Ok(());
        }
        let cleanup = self
            .retention()
            .cleanup(
                &mut catalog,
                (self.clock)(),
                &self.targets,
                Some(&committed.set.id),
                &self.ctx.cancel,
            )
            .await;
        match cleanup {
            Ok(cleanup) => {
                if !cleanup.is_clean() {
                    report.record_problem(&BackupError::CleanupPartialFailure(cleanup.failures.len()));
                }
                report.cleanup = Some(cleanup);
            }
            Err(e) => report.record_problem(&e),
        }
        Ok(())
    }

    async fn seal(artifact: ProducedArtifact) -> BackupResult<SealedArtifact> {
        IntegrityVerifier::seal(&artifact.path, artifact.role).await
    }

    /// Produce the dump and the snapshot into `dir`, sealing each artifact
    /// as soon as its producer returns. A snapshotter that cannot diff
    /// abandons the chain and the snapshot is redone as a Full.
    async fn produce(
        &self,
        catalog: &mut Catalog,
        mut next: NextBackup,
        id: &SetId,
        dir: &std::path::Path,
        report: &mut RunReport,
    ) -> BackupResult<(NextBackup, Vec<SealedArtifact>)> {
        let dump = Self::seal(self.producer.produce(dir).await?).await?;
        self.check_cancelled()?;

        let reference_dir = next.reference.as_ref().map(|r| self.ctx.layout.set_dir(r));
        let request = SnapshotRequest {
            kind: next.kind,
            dest_dir: dir,
            reference_dir: reference_dir.as_deref(),
        };
        let snapshot = match self.snapshotter.snapshot(request).await {
            Ok(artifacts) => artifacts,
            Err(SnapshotError::CannotDiff(reason)) => {
                let abandoned = BackupError::ChainAbandoned {
                    chain_id: next.chain_id.clone(),
                    reason: reason.clone(),
                };
                warn!("⛓️ {}, falling back to a full backup", abandoned);
                catalog.mark_abandoned(&next.chain_id, reason.clone());
                catalog.save().await?;
                report.abandoned_chain = Some((next.chain_id.clone(), reason.clone()));

                next = NextBackup::full(
                    id,
                    DecisionReason::Abandoned {
                        chain_id: next.chain_id.clone(),
                        reason: AbandonReason::Recorded(reason),
                    },
                );
                report.decision = Some(next.reason.clone());
                self.snapshotter
                    .snapshot(SnapshotRequest {
                        kind: next.kind,
                        dest_dir: dir,
                        reference_dir: None,
                    })
                    .await
                    .map_err(|e| BackupError::SnapshotFailed(e.to_string()))?
            }
            Err(SnapshotError::Failed(reason)) => return Err(BackupError::SnapshotFailed(reason)),
        };

        let mut sealed = vec![dump];
        for artifact in snapshot {
            sealed.push(Self::seal(artifact).await?);
        }
        Ok((next, sealed))
    }

    async fn upload_backlog(&self, catalog: &mut Catalog, report: &mut RunReport) -> BackupResult<()> {
        if self.targets.is_empty() {
            return Ok(());
        }
        let sync = RemoteSync::new(self.targets.clone(), &self.ctx.config.upload);
        let outcomes = sync.sync(catalog, &self.ctx.layout, &self.ctx.cancel).await;
        RemoteSync::apply(catalog, &outcomes);
        for failure in outcomes.iter().filter_map(UploadOutcome::error) {
            report.record_problem(&failure);
        }
        report.uploads = outcomes;
        catalog.save().await
    }

    /// Re-verify every locally present set under the run lock
    pub async fn verify(&self) -> BackupResult<Vec<SetVerification>> {
        let _lock = self.lock()?;
        let mut catalog = self.ctx.load_catalog().await?;
        verify_catalog(&mut catalog, &self.ctx.layout).await
    }

    /// Retention plan for the current catalog
    pub async fn plan_cleanup(&self) -> BackupResult<RetentionPlan> {
        let catalog = self.ctx.load_catalog().await?;
        Ok(self.retention().plan(&catalog, (self.clock)(), None))
    }

    /// Apply retention without producing a set
    pub async fn cleanup(&self) -> BackupResult<CleanupReport> {
        let _lock = self.lock()?;
        let mut catalog = self.ctx.load_catalog().await?;
        self.retention()
            .cleanup(&mut catalog, (self.clock)(), &self.targets, None, &self.ctx.cancel)
            .await
    }

    /// Sets currently in the catalog, oldest first
    pub async fn sets(&self) -> BackupResult<Vec<BackupSet>> {
        Ok(self.ctx.load_catalog().await?.sets().cloned().collect())
    }

    fn lock(&self) -> BackupResult<RunLock> {
        self.ctx.layout.prepare()?;
        RunLock::acquire(
            &self.ctx.layout.lock_path(),
            chrono::Duration::hours(i64::from(self.ctx.config.backup.lock_stale_hours)),
        )
    }
}
