//! Subcommand handlers
//!
//! Exit codes: 0 success, 2 partial success (something is left for the
//! next run), 1 failure.

use std::{process::ExitCode, sync::Arc};

use callvault_backup::{
    chain::validate_lineage,
    retention::{ChainAction, ChainDecision, KeepReason},
    set_manager::{BackupSetManager, SetFilter},
    verify::SetVerification,
    BackupJob, BackupScheduler, BackupSet, Chain, ChainTracker, CleanupReport, RunContext, RunStatus, SetId,
    UploadStatus,
};
use chrono::{Duration, Utc};
use tabled::{settings::Style, Table, Tabled};
use tracing::{info, warn};

const PARTIAL: u8 = 2;

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::PartialSuccess => ExitCode::from(PARTIAL),
        RunStatus::Failure => ExitCode::FAILURE,
    }
}

fn print_table<T: Tabled>(rows: Vec<T>, empty: &str) {
    if rows.is_empty() {
        println!("{empty}");
        return;
    }
    let mut table = Table::new(rows);
    table.with(Style::psql());
    println!("{table}");
}

fn upload_label(status: UploadStatus) -> &'static str {
    match status {
        UploadStatus::Pending => "pending",
        UploadStatus::Done => "done",
        UploadStatus::Failed => "failed",
        UploadStatus::Pruned => "pruned",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// One backup run
pub async fn run(ctx: RunContext) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(ctx);
    let report = job.run().await;
    println!("{}", report.render_text());
    Ok(exit_code(report.status))
}

/// Scheduled runs until the context is cancelled
pub async fn daemon(ctx: RunContext) -> anyhow::Result<ExitCode> {
    let cancel = ctx.cancel.clone();
    let schedule = ctx.config.schedule.clone();
    let job = Arc::new(BackupJob::from_config(ctx));

    let mut scheduler = BackupScheduler::new(job, &schedule);
    scheduler.start()?;
    info!("🚀 Callvault daemon running, backups every {}h", schedule.interval_hours);

    cancel.cancelled().await;
    let runs = scheduler.wait().await?;
    info!("👋 Callvault daemon exiting after {} run(s)", runs);
    Ok(ExitCode::SUCCESS)
}

#[derive(Tabled)]
struct SetRow {
    #[tabled(rename = "Set")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Chain")]
    chain: String,
    #[tabled(rename = "Seq")]
    sequence: u32,
    #[tabled(rename = "Size")]
    size: u64,
    #[tabled(rename = "Verified")]
    verified: &'static str,
    #[tabled(rename = "Local")]
    local: &'static str,
    #[tabled(rename = "Uploads")]
    uploads: String,
}

impl From<&BackupSet> for SetRow {
    fn from(set: &BackupSet) -> Self {
        let uploads = set
            .uploaded
            .iter()
            .map(|(target, status)| format!("{target}={}", upload_label(*status)))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            id: set.id.to_string(),
            kind: set.kind.to_string(),
            chain: set.chain_id.to_string(),
            sequence: set.sequence,
            size: set.total_size(),
            verified: yes_no(set.verified),
            local: yes_no(set.locally_present),
            uploads,
        }
    }
}

/// Catalog listing
pub async fn list(
    ctx: RunContext,
    chain: Option<String>,
    older_than_days: Option<u32>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let catalog = ctx.load_catalog().await?;
    let filter = SetFilter {
        chain_id: chain.map(SetId::from),
        created_before: older_than_days.map(|days| Utc::now() - Duration::days(i64::from(days))),
        ..Default::default()
    };
    let targets = ctx.config.targets.iter().map(|t| t.name.clone()).collect();
    let sets = BackupSetManager::new(ctx.layout.clone(), targets).list(&catalog, &filter);

    if json {
        println!("{}", serde_json::to_string_pretty(&sets)?);
    } else {
        print_table(sets.iter().map(SetRow::from).collect(), "No backup sets");
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Tabled)]
struct VerifyRow {
    #[tabled(rename = "Set")]
    id: String,
    #[tabled(rename = "Result")]
    result: &'static str,
    #[tabled(rename = "Problems")]
    problems: String,
}

impl From<&SetVerification> for VerifyRow {
    fn from(verification: &SetVerification) -> Self {
        let problems = verification
            .checks
            .iter()
            .filter(|c| !c.matches)
            .map(|c| format!("{}: {}", c.name, c.detail.as_deref().unwrap_or("mismatch")))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            id: verification.set_id.to_string(),
            result: if verification.passed() { "ok" } else { "FAILED" },
            problems,
        }
    }
}

/// Re-verify local sets
pub async fn verify(ctx: RunContext) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(ctx);
    let results = job.verify().await?;
    let failed = results.iter().filter(|v| !v.passed()).count();
    print_table(results.iter().map(VerifyRow::from).collect(), "No local sets to verify");

    if failed > 0 {
        warn!("❌ {} set(s) failed verification", failed);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "Chain")]
    id: String,
    #[tabled(rename = "Sets")]
    members: usize,
    #[tabled(rename = "Head seq")]
    head: String,
    #[tabled(rename = "Restorable")]
    restorable: &'static str,
    #[tabled(rename = "Extendable")]
    extendable: String,
}

/// Lineage validation and per-chain restorability
pub async fn check(ctx: RunContext) -> anyhow::Result<ExitCode> {
    let catalog = ctx.load_catalog().await?;
    let rows = Chain::all(&catalog)
        .iter()
        .map(|chain| ChainRow {
            id: chain.id.to_string(),
            members: chain.members.len(),
            head: chain.max_sequence().map_or_else(|| "-".into(), |s| s.to_string()),
            restorable: yes_no(chain.is_restorable()),
            extendable: ChainTracker::abandonment(&catalog, chain)
                .map_or_else(|| "yes".into(), |reason| format!("no ({reason})")),
        })
        .collect();
    print_table(rows, "No backup chains");

    let violations = validate_lineage(&catalog);
    for violation in &violations {
        println!(
            "lineage gap: set {} claims sequence {} in chain {}",
            violation.set_id, violation.sequence, violation.chain_id
        );
    }
    Ok(if violations.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "Chain")]
    id: String,
    #[tabled(rename = "Sets")]
    members: usize,
    #[tabled(rename = "Newest")]
    newest: String,
    #[tabled(rename = "Action")]
    action: &'static str,
}

impl From<&ChainDecision> for PlanRow {
    fn from(decision: &ChainDecision) -> Self {
        let action = match decision.action {
            ChainAction::Prune => "prune",
            ChainAction::Keep(KeepReason::Young) => "keep (young)",
            ChainAction::Keep(KeepReason::Protected) => "keep (protected)",
            ChainAction::Keep(KeepReason::LastRestorable) => "keep (last restorable)",
            ChainAction::Keep(KeepReason::Incomplete) => "keep (incomplete)",
            ChainAction::Keep(KeepReason::AlreadyPurged) => "keep (purged)",
        };
        Self {
            id: decision.chain_id.to_string(),
            members: decision.members.len(),
            newest: decision
                .newest
                .map_or_else(|| "-".into(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
            action,
        }
    }
}

fn print_cleanup(report: &CleanupReport) {
    println!(
        "Removed {} local set(s) and {} remote copy(ies)",
        report.deleted_local.len(),
        report.deleted_remote.len()
    );
    for chain in &report.exempted {
        println!("kept past retention to stay restorable: chain {chain}");
    }
    for failure in &report.failures {
        println!(
            "failed: set {} target {}: {}",
            failure.set_id.as_ref().map_or_else(|| "-".into(), ToString::to_string),
            failure.target.as_deref().unwrap_or("local"),
            failure.reason
        );
    }
}

/// Retention without a backup
pub async fn cleanup(ctx: RunContext, dry_run: bool) -> anyhow::Result<ExitCode> {
    let job = BackupJob::from_config(ctx);
    if dry_run {
        let plan = job.plan_cleanup().await?;
        println!("Retention cutoff: {}", plan.cutoff.format("%Y-%m-%d %H:%M UTC"));
        print_table(plan.decisions.iter().map(PlanRow::from).collect(), "No backup chains");
        return Ok(ExitCode::SUCCESS);
    }

    let report = job.cleanup().await?;
    print_cleanup(&report);
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(PARTIAL)
    })
}
