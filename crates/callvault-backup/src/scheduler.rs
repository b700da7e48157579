//! Scheduled backup runs
//!
//! Runs the backup job on a fixed interval until cancelled. Cancelling the
//! job's token stops the loop and aborts an in-flight run the same way a
//! one-shot run is aborted: nothing uncommitted survives.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{sync::Arc, time::Duration};

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    error::{BackupError, BackupResult},
    notify::RunStatus,
    run::BackupJob,
    ScheduleConfig,
};

/// Manages scheduled backup operations
#[derive(Debug)]
pub struct BackupScheduler {
    job: Arc<BackupJob>,
    interval: Duration,
    run_on_start: bool,
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<u64>>,
}

impl BackupScheduler {
    /// Scheduler for `job` following `schedule`
    pub fn new(job: Arc<BackupJob>, schedule: &ScheduleConfig) -> Self {
        let interval = Duration::from_secs(u64::from(schedule.interval_hours.max(1)) * 3600);
        Self::with_interval(job, interval, schedule.run_on_start)
    }

    /// Scheduler with an explicit interval
    pub fn with_interval(job: Arc<BackupJob>, interval: Duration, run_on_start: bool) -> Self {
        let cancel = job.cancel_token();
        Self {
            job,
            interval,
            run_on_start,
            cancel,
            handle: None,
        }
    }

    /// Start the backup scheduler
    #[instrument(skip(self))]
    pub fn start(&mut self) -> BackupResult<()> {
        if self.handle.is_some() {
            return Err(BackupError::config("Scheduler already running"));
        }

        let job = self.job.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let run_on_start = self.run_on_start;
        self.handle = Some(tokio::spawn(async move {
            Self::run_scheduled_backups(job, interval, run_on_start, cancel).await
        }));

        info!("⏰ Backup scheduler started (every {:?})", self.interval);
        Ok(())
    }

    /// Cancel the loop and any in-flight run, then wait for it to wind down.
    /// Returns the number of runs executed.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> BackupResult<u64> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait until the loop exits after cancellation
    pub async fn wait(&mut self) -> BackupResult<u64> {
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        let runs = handle
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(format!("scheduler task failed: {e}"))))?;
        info!("🛑 Backup scheduler stopped after {} run(s)", runs);
        Ok(runs)
    }

    /// Main backup scheduling loop
    async fn run_scheduled_backups(
        job: Arc<BackupJob>,
        interval: Duration,
        run_on_start: bool,
        cancel: CancellationToken,
    ) -> u64 {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !run_on_start {
            ticker.tick().await; // Skip immediate first tick
        }

        let mut runs = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            info!("⏰ Running scheduled backup");
            let report = job.run().await;
            runs += 1;
            if report.status != RunStatus::Success {
                warn!("⚠️ Scheduled backup finished with status {}", report.status);
            }
        }
        runs
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        run::RunContext,
        testutil::{test_config, FakeDump, FakeSnapshotter},
    };
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_scheduler_lifecycle() {
        let temp_dir = tempdir().unwrap();
        let job = Arc::new(BackupJob::new(
            RunContext::new(test_config(temp_dir.path())),
            Arc::new(FakeDump::default()),
            Arc::new(FakeSnapshotter),
            vec![],
        ));

        let mut scheduler = BackupScheduler::with_interval(job.clone(), Duration::from_millis(20), true);
        assert!(scheduler.start().is_ok());
        assert!(scheduler.start().is_err());

        // Wait until at least one run has committed a set
        for _ in 0..200 {
            if !job.sets().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let runs = scheduler.stop().await.unwrap();
        assert!(runs >= 1);
        assert!(!job.sets().await.unwrap().is_empty());
        assert!(job.cancel_token().is_cancelled());
    }
}
