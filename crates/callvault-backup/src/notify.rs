//! Run reports and notification
//!
//! Each run produces exactly one `RunReport`. Notifiers deliver it; a
//! notifier failure is logged and never changes the run outcome.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{fmt, fmt::Write as _, process::Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    chain::DecisionReason,
    error::{BackupError, BackupResult},
    model::{BackupKind, BackupSet, SetId},
    remote::{UploadOutcome, UploadResult},
    retention::CleanupReport,
    verify::ArtifactCheck,
};

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Set committed, uploaded everywhere, cleanup clean
    Success,
    /// Set committed but some upload or cleanup action is outstanding
    PartialSuccess,
    /// No set committed
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::PartialSuccess => f.write_str("PARTIAL SUCCESS"),
            Self::Failure => f.write_str("FAILURE"),
        }
    }
}

/// The set a run committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSummary {
    /// Set id
    pub id: SetId,
    /// Full or incremental
    pub kind: BackupKind,
    /// Chain
    pub chain_id: SetId,
    /// Position in the chain
    pub sequence: u32,
    /// Bytes on disk
    pub size_bytes: u64,
}

impl From<&BackupSet> for SetSummary {
    fn from(set: &BackupSet) -> Self {
        Self {
            id: set.id.clone(),
            kind: set.kind,
            chain_id: set.chain_id.clone(),
            sequence: set.sequence,
            size_bytes: set.total_size(),
        }
    }
}

/// Structured result of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run id
    pub run_id: Uuid,
    /// Host the run executed on
    pub hostname: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Terminal status
    pub status: RunStatus,
    /// Why the tracker chose the kind of the set
    pub decision: Option<DecisionReason>,
    /// Chain abandoned during this run and why
    pub abandoned_chain: Option<(SetId, String)>,
    /// Committed set
    pub set: Option<SetSummary>,
    /// Per-artifact verification results
    pub verification: Vec<ArtifactCheck>,
    /// Per (set, target) upload results, including backlog
    pub uploads: Vec<UploadOutcome>,
    /// Cleanup results, when cleanup ran
    pub cleanup: Option<CleanupReport>,
    /// Orphaned staging or set directories removed at start
    pub recovered: usize,
    /// Problems recorded after the set was committed (upload, cleanup,
    /// catalog save); they leave the run partially successful
    pub problems: Vec<String>,
    /// Fatal error that ended the run
    pub error: Option<String>,
}

impl RunReport {
    /// Empty report for a run starting now
    pub fn begin() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            hostname: sys_info::hostname().unwrap_or_else(|_| "unknown".to_string()),
            started_at: now,
            finished_at: now,
            status: RunStatus::Failure,
            decision: None,
            abandoned_chain: None,
            set: None,
            verification: Vec::new(),
            uploads: Vec::new(),
            cleanup: None,
            recovered: 0,
            problems: Vec::new(),
            error: None,
        }
    }

    /// Upload outcomes that did not reach `Done`
    pub fn outstanding_uploads(&self) -> impl Iterator<Item = &UploadOutcome> {
        self.uploads.iter().filter(|u| u.result != UploadResult::Done)
    }

    /// Record a failure that does not undo the committed set
    pub fn record_problem(&mut self, problem: &BackupError) {
        warn!("⚠️ {}", problem);
        self.problems.push(problem.to_string());
    }

    /// Derive and record the terminal status
    pub fn finish(&mut self, error: Option<&BackupError>) -> RunStatus {
        self.finished_at = Utc::now();
        self.error = error.map(ToString::to_string);
        let cleanup_failed = self.cleanup.as_ref().is_some_and(|c| !c.is_clean());
        self.status = if self.error.is_some() || self.set.is_none() {
            RunStatus::Failure
        } else if self.outstanding_uploads().next().is_some() || cleanup_failed || !self.problems.is_empty() {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        };
        self.status
    }

    /// Plain text rendering used for mail notifications
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "callvault backup on {}: {}", self.hostname, self.status);
        let _ = writeln!(out, "run {} ({} -> {})", self.run_id, self.started_at, self.finished_at);
        if let Some(error) = &self.error {
            let _ = writeln!(out, "error: {error}");
        }
        for problem in &self.problems {
            let _ = writeln!(out, "problem: {problem}");
        }
        if let Some((chain, reason)) = &self.abandoned_chain {
            let _ = writeln!(out, "abandoned chain {chain}: {reason}");
        }
        if let Some(set) = &self.set {
            let _ = writeln!(
                out,
                "set {} {} chain {} seq {} ({} bytes)",
                set.id, set.kind, set.chain_id, set.sequence, set.size_bytes
            );
        }
        for check in self.verification.iter().filter(|c| !c.matches) {
            let _ = writeln!(out, "verify {}: {}", check.name, check.detail.as_deref().unwrap_or("mismatch"));
        }
        for upload in &self.uploads {
            let _ = writeln!(out, "upload {} -> {}: {:?}", upload.set_id, upload.target, upload.result);
        }
        if let Some(cleanup) = &self.cleanup {
            let _ = writeln!(
                out,
                "cleanup: {} local, {} remote removed, {} failures",
                cleanup.deleted_local.len(),
                cleanup.deleted_remote.len(),
                cleanup.failures.len()
            );
            for failure in &cleanup.failures {
                let _ = writeln!(
                    out,
                    "  {} {}: {}",
                    failure.target.as_deref().unwrap_or("local"),
                    failure.set_id.as_ref().map(SetId::as_str).unwrap_or("-"),
                    failure.reason
                );
            }
        }
        out
    }
}

/// Delivers run reports
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Send one report
    async fn notify(&self, report: &RunReport) -> BackupResult<()>;
}

/// Writes the report summary to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, report: &RunReport) -> BackupResult<()> {
        let set = report.set.as_ref().map(|s| s.id.to_string()).unwrap_or_else(|| "-".into());
        let outstanding = report.outstanding_uploads().count();
        match report.status {
            RunStatus::Success => info!(run_id = %report.run_id, "✅ Backup run succeeded (set {})", set),
            RunStatus::PartialSuccess => warn!(
                run_id = %report.run_id,
                "⚠️ Backup run partially succeeded (set {}, {} upload(s) outstanding)",
                set,
                outstanding
            ),
            RunStatus::Failure => error!(
                run_id = %report.run_id,
                "❌ Backup run failed: {}",
                report.error.as_deref().unwrap_or("no set committed")
            ),
        }
        Ok(())
    }
}

/// Report body format for the command notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Human readable summary
    #[default]
    Text,
    /// The report as JSON
    Json,
}

/// Notification settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command that receives the report on stdin, e.g. `["mail", "-s", "backup", "ops@example.net"]`
    pub command: Vec<String>,
    /// Body format
    pub format: ReportFormat,
    /// Only notify when the run did not fully succeed
    pub only_on_problems: bool,
}

/// Pipes the report into an external command
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    config: NotifyConfig,
}

impl CommandNotifier {
    /// Notifier for the configured command
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }

    fn body(&self, report: &RunReport) -> BackupResult<Vec<u8>> {
        Ok(match self.config.format {
            ReportFormat::Text => report.render_text().into_bytes(),
            ReportFormat::Json => serde_json::to_vec_pretty(report)?,
        })
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, report: &RunReport) -> BackupResult<()> {
        if self.config.only_on_problems && report.status == RunStatus::Success {
            return Ok(());
        }
        let Some((program, args)) = self.config.command.split_first() else {
            return Ok(());
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&self.body(report)?).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BackupError::Io(std::io::Error::other(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        info!("📧 Run report sent via {}", program);
        Ok(())
    }
}

/// Deliver a report through every notifier, logging failures
pub async fn notify_all(notifiers: &[Box<dyn Notifier>], report: &RunReport) {
    for notifier in notifiers {
        if let Err(e) = notifier.notify(report).await {
            error!("❌ Notifier {:?} failed: {}", notifier, e);
        }
    }
}
