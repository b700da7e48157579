//! Retention and cleanup
//!
//! Retention works on whole chains: a chain is only removed when every
//! member is past the cutoff, and the newest restorable chain survives even
//! if it is old. Planning is pure; applying the plan deletes local set
//! directories newest member first (so an interrupted run leaves a
//! restorable prefix) and removes remote copies per target.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    catalog::Catalog,
    chain::Chain,
    error::BackupResult,
    model::{SetId, UploadStatus},
    remote::RemoteTarget,
    utils::{remove_dir_if_exists, BackupLayout},
};

/// Retention settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Chains whose newest member is older than this are removed
    pub max_age_days: u32,
    /// Also remove chains that are not restorable once they age out
    pub prune_incomplete_chains: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 14,
            prune_incomplete_chains: false,
        }
    }
}

/// Why a chain is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    /// At least one member is newer than the cutoff
    Young,
    /// The current run extended or started it
    Protected,
    /// It is the newest restorable chain and nothing newer is restorable
    LastRestorable,
    /// It is not restorable and pruning incomplete chains is disabled
    Incomplete,
    /// Nothing of it is left anywhere
    AlreadyPurged,
}

/// What happens to a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum ChainAction {
    /// Remove every member locally and on the cleanup targets
    Prune,
    /// Leave the chain alone
    Keep(KeepReason),
}

/// Per-chain retention decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDecision {
    /// Chain id
    pub chain_id: SetId,
    /// Member ids, ascending sequence
    pub members: Vec<SetId>,
    /// Creation time of the newest member
    pub newest: Option<DateTime<Utc>>,
    /// Whether the chain is restorable right now
    pub restorable: bool,
    /// Decision
    pub action: ChainAction,
}

/// Retention decisions for every chain in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlan {
    /// Sets created before this are past retention
    pub cutoff: DateTime<Utc>,
    /// One entry per chain, oldest first
    pub decisions: Vec<ChainDecision>,
}

impl RetentionPlan {
    /// Chains that will be removed
    pub fn to_prune(&self) -> impl Iterator<Item = &ChainDecision> {
        self.decisions.iter().filter(|d| d.action == ChainAction::Prune)
    }

    /// Chains kept only to preserve a restorable chain
    pub fn exempted(&self) -> Vec<SetId> {
        self.decisions
            .iter()
            .filter(|d| d.action == ChainAction::Keep(KeepReason::LastRestorable))
            .map(|d| d.chain_id.clone())
            .collect()
    }
}

/// A remote copy removed by cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeletion {
    /// Target name
    pub target: String,
    /// Set removed
    pub set_id: SetId,
}

/// A cleanup action that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Set concerned, if the failure was set specific
    pub set_id: Option<SetId>,
    /// Target concerned; `None` for local deletion
    pub target: Option<String>,
    /// Error text
    pub reason: String,
}

/// What cleanup did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Sets whose local artifacts were removed
    pub deleted_local: Vec<SetId>,
    /// Remote copies removed
    pub deleted_remote: Vec<RemoteDeletion>,
    /// Chains kept past their age to preserve restorability
    pub exempted: Vec<SetId>,
    /// Actions that failed; the rest were still applied
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Whether every planned action succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies the retention policy to the catalog and its storage
#[derive(Debug, Clone)]
pub struct RetentionEngine {
    policy: RetentionPolicy,
    layout: BackupLayout,
}

impl RetentionEngine {
    /// Engine for `policy` over the sets stored in `layout`
    pub fn new(policy: RetentionPolicy, layout: BackupLayout) -> Self {
        Self { policy, layout }
    }

    /// Decide per chain what to keep. `protect` names a set whose chain
    /// must not be touched (the set the current run produced).
    pub fn plan(&self, catalog: &Catalog, now: DateTime<Utc>, protect: Option<&SetId>) -> RetentionPlan {
        let cutoff = now - Duration::days(i64::from(self.policy.max_age_days));
        let protected_chain = protect.and_then(|id| catalog.get(id)).map(|s| s.chain_id.clone());

        let mut decisions: Vec<ChainDecision> = Chain::all(catalog)
            .into_iter()
            .map(|chain| {
                let newest = chain.newest_created_at();
                let restorable = chain.is_restorable();
                let action = if chain.is_purged() {
                    ChainAction::Keep(KeepReason::AlreadyPurged)
                } else if protected_chain.as_ref() == Some(&chain.id) {
                    ChainAction::Keep(KeepReason::Protected)
                } else if newest.map_or(true, |t| t >= cutoff) {
                    ChainAction::Keep(KeepReason::Young)
                } else if !restorable && !self.policy.prune_incomplete_chains {
                    ChainAction::Keep(KeepReason::Incomplete)
                } else {
                    ChainAction::Prune
                };
                ChainDecision {
                    chain_id: chain.id.clone(),
                    members: chain.members.iter().map(|s| s.id.clone()).collect(),
                    newest,
                    restorable,
                    action,
                }
            })
            .collect();

        let keeps_restorable = decisions
            .iter()
            .any(|d| d.restorable && matches!(d.action, ChainAction::Keep(r) if r != KeepReason::AlreadyPurged));
        if !keeps_restorable {
            if let Some(newest) = decisions
                .iter_mut()
                .filter(|d| d.restorable && d.action == ChainAction::Prune)
                .max_by_key(|d| d.newest)
            {
                info!("🛡 Keeping chain {} past retention as the last restorable chain", newest.chain_id);
                newest.action = ChainAction::Keep(KeepReason::LastRestorable);
            }
        }

        RetentionPlan { cutoff, decisions }
    }

    /// Plan and apply retention, then save the catalog.
    #[instrument(skip_all, fields(max_age_days = self.policy.max_age_days))]
    pub async fn cleanup(
        &self,
        catalog: &mut Catalog,
        now: DateTime<Utc>,
        keep_targets: &[Arc<dyn RemoteTarget>],
        protect: Option<&SetId>,
        cancel: &CancellationToken,
    ) -> BackupResult<CleanupReport> {
        let plan = self.plan(catalog, now, protect);
        let report = self.apply(catalog, &plan, keep_targets, cancel).await;
        catalog.save().await?;
        Ok(report)
    }

    /// Execute a plan. Failures are collected; one failing target never
    /// stops local deletion or the other targets.
    pub async fn apply(
        &self,
        catalog: &mut Catalog,
        plan: &RetentionPlan,
        keep_targets: &[Arc<dyn RemoteTarget>],
        cancel: &CancellationToken,
    ) -> CleanupReport {
        let mut report = CleanupReport {
            exempted: plan.exempted(),
            ..Default::default()
        };
        let mut listings: BTreeMap<String, Option<BTreeSet<SetId>>> = BTreeMap::new();

        for decision in plan.to_prune() {
            if cancel.is_cancelled() {
                warn!("🚫 Cleanup cancelled before chain {}", decision.chain_id);
                break;
            }
            info!("🗑 Pruning chain {} ({} sets)", decision.chain_id, decision.members.len());

            self.prune_local(catalog, decision, &mut report).await;

            for target in keep_targets {
                let listing = match listings.get(target.name()) {
                    Some(listing) => listing.clone(),
                    None => {
                        let listing = match target.list().await {
                            Ok(ids) => Some(ids.into_iter().collect::<BTreeSet<_>>()),
                            Err(e) => {
                                error!("❌ Cannot list target {}: {}", target.name(), e);
                                report.failures.push(CleanupFailure {
                                    set_id: None,
                                    target: Some(target.name().to_string()),
                                    reason: e.to_string(),
                                });
                                None
                            }
                        };
                        listings.insert(target.name().to_string(), listing.clone());
                        listing
                    }
                };
                let Some(listing) = listing else {
                    continue;
                };
                Self::prune_remote(catalog, decision, target.as_ref(), &listing, &mut report).await;
            }
        }

        if !report.is_clean() {
            warn!("⚠️ Cleanup finished with {} failure(s)", report.failures.len());
        }
        report
    }

    async fn prune_local(&self, catalog: &mut Catalog, decision: &ChainDecision, report: &mut CleanupReport) {
        for set_id in decision.members.iter().rev() {
            let Some(set) = catalog.get_mut(set_id) else {
                continue;
            };
            if !set.locally_present {
                continue;
            }
            match remove_dir_if_exists(&self.layout.set_dir(set_id)).await {
                Ok(_) => {
                    set.locally_present = false;
                    report.deleted_local.push(set_id.clone());
                }
                Err(e) => {
                    error!("❌ Failed to delete local set {}: {}", set_id, e);
                    report.failures.push(CleanupFailure {
                        set_id: Some(set_id.clone()),
                        target: None,
                        reason: e.to_string(),
                    });
                    // Older members stay so what remains is still a prefix
                    return;
                }
            }
        }
    }

    async fn prune_remote(
        catalog: &mut Catalog,
        decision: &ChainDecision,
        target: &dyn RemoteTarget,
        listing: &BTreeSet<SetId>,
        report: &mut CleanupReport,
    ) {
        for set_id in decision.members.iter().rev() {
            let tracked = catalog
                .get(set_id)
                .and_then(|s| s.upload_status(target.name()))
                .is_some_and(|s| s != UploadStatus::Pruned);
            if !tracked && !listing.contains(set_id) {
                continue;
            }

            if listing.contains(set_id) {
                if let Err(e) = target.delete(set_id).await {
                    error!("❌ Failed to delete {} from {}: {}", set_id, target.name(), e);
                    report.failures.push(CleanupFailure {
                        set_id: Some(set_id.clone()),
                        target: Some(target.name().to_string()),
                        reason: e.to_string(),
                    });
                    return;
                }
                report.deleted_remote.push(RemoteDeletion {
                    target: target.name().to_string(),
                    set_id: set_id.clone(),
                });
            }
            if let Some(set) = catalog.get_mut(set_id) {
                if let Some(status) = set.uploaded.get_mut(target.name()) {
                    *status = UploadStatus::Pruned;
                }
            }
        }
    }
}
