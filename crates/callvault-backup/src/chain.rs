//! Chain tracking
//!
//! A chain is a Full set plus the incrementals built on it. The tracker
//! decides what the next backup must be and whether an existing chain can
//! still be extended.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    catalog::Catalog,
    model::{BackupKind, BackupSet, SetId},
};

/// Read-only view over the members of one chain
#[derive(Debug, Clone)]
pub struct Chain<'a> {
    /// Chain id (id of its Full)
    pub id: SetId,
    /// Members ordered by sequence
    pub members: Vec<&'a BackupSet>,
}

impl<'a> Chain<'a> {
    /// Collect a chain from the catalog
    pub fn from_catalog(catalog: &'a Catalog, chain_id: &SetId) -> Self {
        Self {
            id: chain_id.clone(),
            members: catalog.chain_members(chain_id),
        }
    }

    /// All chains in the catalog, oldest first
    pub fn all(catalog: &'a Catalog) -> Vec<Self> {
        catalog
            .chain_ids()
            .iter()
            .map(|id| Self::from_catalog(catalog, id))
            .collect()
    }

    /// Highest sequence recorded
    pub fn max_sequence(&self) -> Option<u32> {
        self.members.last().map(|s| s.sequence)
    }

    /// Most recent member
    pub fn head(&self) -> Option<&'a BackupSet> {
        self.members.last().copied()
    }

    /// Creation time of the newest member
    pub fn newest_created_at(&self) -> Option<DateTime<Utc>> {
        self.members.iter().map(|s| s.created_at).max()
    }

    /// Full at sequence 0 followed by 1..=max with no gaps or duplicates
    pub fn is_contiguous(&self) -> bool {
        !self.members.is_empty()
            && self.members.iter().enumerate().all(|(i, s)| {
                s.sequence as usize == i
                    && (i == 0) == (s.kind == BackupKind::Full)
                    && (i != 0 || s.id == self.id)
            })
    }

    /// Every member present (locally or remotely) and verified, with no gaps
    pub fn is_restorable(&self) -> bool {
        self.is_contiguous() && self.members.iter().all(|s| s.verified && s.is_present())
    }

    /// No member is present anywhere any more
    pub fn is_purged(&self) -> bool {
        self.members.iter().all(|s| !s.is_present())
    }

    /// Restorable from local disk alone
    pub fn is_locally_complete(&self) -> bool {
        self.is_contiguous() && self.members.iter().all(|s| s.verified && s.locally_present)
    }
}

/// Why a chain may not be extended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    /// The chain's latest set failed (re-)verification
    HeadUnverified(SetId),
    /// An earlier member failed re-verification, so the chain cannot be restored
    MemberUnverified(SetId),
    /// The chain has a sequence gap or a missing Full
    Broken,
    /// The reference artifacts of the latest set are no longer on disk
    ReferenceMissing(SetId),
    /// Recorded earlier, e.g. the snapshotter could not diff
    Recorded(String),
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeadUnverified(id) => write!(f, "latest set {id} is not verified"),
            Self::MemberUnverified(id) => write!(f, "member set {id} is not verified"),
            Self::Broken => f.write_str("chain has a sequence gap"),
            Self::ReferenceMissing(id) => write!(f, "reference set {id} is not present locally"),
            Self::Recorded(reason) => f.write_str(reason),
        }
    }
}

/// Why the tracker chose a backup kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionReason {
    /// Catalog has no chain yet
    NoChain,
    /// Previous chain reached the configured history depth
    DepthReached,
    /// Previous chain cannot be extended
    Abandoned {
        /// Abandoned chain
        chain_id: SetId,
        /// Cause
        reason: AbandonReason,
    },
    /// Previous chain is extended by one
    Extend,
}

/// Type and position of the next backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextBackup {
    /// Full or incremental
    pub kind: BackupKind,
    /// Chain the new set belongs to
    pub chain_id: SetId,
    /// Position in that chain
    pub sequence: u32,
    /// Set the incremental is diffed against
    pub reference: Option<SetId>,
    /// Why this was chosen
    pub reason: DecisionReason,
}

impl NextBackup {
    /// A new chain started by the set `new_id`
    pub fn full(new_id: &SetId, reason: DecisionReason) -> Self {
        Self {
            kind: BackupKind::Full,
            chain_id: new_id.clone(),
            sequence: 0,
            reference: None,
            reason,
        }
    }
}

/// Decides full vs incremental from catalog lineage
#[derive(Debug, Clone, Copy)]
pub struct ChainTracker {
    history_depth: u32,
}

impl ChainTracker {
    /// Tracker for the configured history depth
    pub fn new(history_depth: u32) -> Self {
        Self { history_depth }
    }

    /// Check whether a chain can still be extended
    pub fn abandonment(catalog: &Catalog, chain: &Chain<'_>) -> Option<AbandonReason> {
        if let Some(reason) = catalog.abandoned_reason(&chain.id) {
            return Some(AbandonReason::Recorded(reason.to_string()));
        }
        if !chain.is_contiguous() {
            return Some(AbandonReason::Broken);
        }
        let head = chain.head()?;
        if !head.verified {
            return Some(AbandonReason::HeadUnverified(head.id.clone()));
        }
        if let Some(member) = chain.members.iter().find(|s| !s.verified) {
            return Some(AbandonReason::MemberUnverified(member.id.clone()));
        }
        if !head.locally_present {
            return Some(AbandonReason::ReferenceMissing(head.id.clone()));
        }
        None
    }

    /// Decide the kind, chain and sequence of the set `new_id` about to be produced
    #[instrument(level = "debug", skip(self, catalog))]
    pub fn decide_next(&self, catalog: &Catalog, new_id: &SetId) -> NextBackup {
        let Some(latest) = catalog.latest() else {
            info!("🆕 No backup chain yet, starting a full backup");
            return NextBackup::full(new_id, DecisionReason::NoChain);
        };

        let chain = Chain::from_catalog(catalog, &latest.chain_id);
        if let Some(reason) = Self::abandonment(catalog, &chain) {
            info!("⛓️ Chain {} cannot be extended ({}), forcing full backup", chain.id, reason);
            return NextBackup::full(
                new_id,
                DecisionReason::Abandoned {
                    chain_id: chain.id.clone(),
                    reason,
                },
            );
        }

        let highest = chain.max_sequence().unwrap_or(0);
        if highest.saturating_add(1) < self.history_depth {
            debug!("📈 Extending chain {} to sequence {}", chain.id, highest + 1);
            return NextBackup {
                kind: BackupKind::Incremental,
                chain_id: chain.id.clone(),
                sequence: highest + 1,
                reference: chain.head().map(|s| s.id.clone()),
                reason: DecisionReason::Extend,
            };
        }

        info!("🔁 Chain {} reached history depth {}, starting a full backup", chain.id, self.history_depth);
        NextBackup::full(new_id, DecisionReason::DepthReached)
    }
}

/// An incremental whose predecessor is missing from its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageViolation {
    /// Offending set
    pub set_id: SetId,
    /// Its chain
    pub chain_id: SetId,
    /// Its sequence
    pub sequence: u32,
}

/// Every incremental must have a predecessor at `sequence - 1` in its chain
pub fn validate_lineage(catalog: &Catalog) -> Vec<LineageViolation> {
    catalog
        .sets()
        .filter(|set| set.kind == BackupKind::Incremental)
        .filter(|set| {
            set.sequence == 0
                || !catalog
                    .chain_members(&set.chain_id)
                    .iter()
                    .any(|m| m.sequence == set.sequence - 1)
        })
        .map(|set| LineageViolation {
            set_id: set.id.clone(),
            chain_id: set.chain_id.clone(),
            sequence: set.sequence,
        })
        .collect()
}
