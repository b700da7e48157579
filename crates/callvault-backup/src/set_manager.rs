//! Backup set assembly and commit
//!
//! Artifacts are produced into `staging/<id>/`. A set becomes catalog
//! visible only once every artifact re-verifies, at which point its
//! directory is moved to `sets/<id>/` and the catalog is saved. Anything
//! that fails along the way is removed, never half-committed.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use crate::{
    catalog::Catalog,
    error::{BackupError, BackupResult},
    model::{ArtifactRole, BackupKind, BackupSet, SetId, UploadStatus},
    utils::{remove_dir_if_exists, sweep_staging, BackupLayout},
    verify::{ArtifactCheck, IntegrityVerifier, SealedArtifact},
};

/// A set whose artifacts exist but are not yet committed
#[derive(Debug, Clone)]
pub struct StagedSet {
    /// Id allocated for the set
    pub id: SetId,
    /// Creation time matching the id
    pub created_at: DateTime<Utc>,
    /// Full or incremental
    pub kind: BackupKind,
    /// Chain the set extends or starts
    pub chain_id: SetId,
    /// Position in the chain
    pub sequence: u32,
    /// Staging directory
    pub dir: PathBuf,
    /// Artifacts sealed at close time
    pub artifacts: Vec<SealedArtifact>,
}

/// Result of a successful commit
#[derive(Debug, Clone)]
pub struct Committed {
    /// The catalog record
    pub set: BackupSet,
    /// Per-artifact verification results
    pub checks: Vec<ArtifactCheck>,
}

/// Catalog query
#[derive(Debug, Clone, Default)]
pub struct SetFilter {
    /// Only sets of this chain
    pub chain_id: Option<SetId>,
    /// Only sets created strictly before this time
    pub created_before: Option<DateTime<Utc>>,
    /// Only sets created at or after this time
    pub created_since: Option<DateTime<Utc>>,
    /// Only sets of this kind
    pub kind: Option<BackupKind>,
    /// Only sets whose local artifacts are (or are not) present
    pub locally_present: Option<bool>,
}

impl SetFilter {
    /// Members of one chain
    pub fn chain(chain_id: SetId) -> Self {
        Self {
            chain_id: Some(chain_id),
            ..Default::default()
        }
    }

    /// Sets created before `cutoff`
    pub fn older_than(cutoff: DateTime<Utc>) -> Self {
        Self {
            created_before: Some(cutoff),
            ..Default::default()
        }
    }

    fn matches(&self, set: &BackupSet) -> bool {
        self.chain_id.as_ref().map_or(true, |c| &set.chain_id == c)
            && self.created_before.map_or(true, |t| set.created_at < t)
            && self.created_since.map_or(true, |t| set.created_at >= t)
            && self.kind.map_or(true, |k| set.kind == k)
            && self.locally_present.map_or(true, |p| set.locally_present == p)
    }
}

/// Assembles, verifies and commits backup sets
#[derive(Debug, Clone)]
pub struct BackupSetManager {
    layout: BackupLayout,
    targets: Vec<String>,
}

impl BackupSetManager {
    /// Manager writing into `layout`; new sets start `Pending` on every target
    pub fn new(layout: BackupLayout, targets: Vec<String>) -> Self {
        Self { layout, targets }
    }

    /// Remove leftovers of runs that crashed before committing: every
    /// staging directory, and set directories the catalog does not know.
    #[instrument(skip(self, catalog))]
    pub async fn recover(&self, catalog: &Catalog) -> BackupResult<usize> {
        let mut removed = sweep_staging(&self.layout).await?.len();

        let mut dir = match tokio::fs::read_dir(self.layout.sets_root()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if catalog.get(&SetId::from(name.as_str())).is_none() {
                warn!("🧹 Removing set directory unknown to the catalog: {}", name);
                if remove_dir_if_exists(&entry.path()).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Create the staging directory for a new set
    pub async fn stage(&self, id: &SetId) -> BackupResult<PathBuf> {
        let dir = self.layout.staging_dir(id);
        remove_dir_if_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Drop a staged set and its artifacts
    pub async fn discard(&self, staged_dir: &std::path::Path) {
        if let Err(e) = remove_dir_if_exists(staged_dir).await {
            error!("❌ Failed to remove staged artifacts {:?}: {}", staged_dir, e);
        }
    }

    /// Verify and commit a staged set. On verification failure the staged
    /// artifacts are removed and the catalog is left untouched.
    #[instrument(skip(self, catalog, staged), fields(set_id = %staged.id, kind = %staged.kind, sequence = staged.sequence))]
    pub async fn commit(&self, catalog: &mut Catalog, staged: StagedSet) -> BackupResult<Committed> {
        if let Err(e) = Self::check_shape(catalog, &staged) {
            self.discard(&staged.dir).await;
            return Err(e);
        }

        let mut checks = Vec::with_capacity(staged.artifacts.len());
        for sealed in &staged.artifacts {
            checks.push(IntegrityVerifier::verify(&sealed.path, &sealed.artifact).await);
        }
        if checks.iter().any(|c| !c.matches) {
            self.discard(&staged.dir).await;
            return Err(BackupError::VerificationFailed {
                set_id: staged.id,
                checks,
            });
        }

        let set_dir = self.layout.set_dir(&staged.id);
        tokio::fs::create_dir_all(self.layout.sets_root()).await?;
        if let Err(e) = tokio::fs::rename(&staged.dir, &set_dir).await {
            self.discard(&staged.dir).await;
            return Err(e.into());
        }

        let set = BackupSet {
            id: staged.id.clone(),
            kind: staged.kind,
            chain_id: staged.chain_id,
            sequence: staged.sequence,
            created_at: staged.created_at,
            artifacts: staged.artifacts.into_iter().map(|s| s.artifact).collect(),
            verified: true,
            uploaded: self
                .targets
                .iter()
                .map(|t| (t.clone(), UploadStatus::Pending))
                .collect::<BTreeMap<_, _>>(),
            locally_present: true,
        };

        catalog.insert(set.clone());
        if let Err(e) = catalog.save().await {
            catalog.remove(&set.id);
            self.discard(&set_dir).await;
            return Err(e);
        }

        info!(
            "✅ Committed {} set {} (chain {}, sequence {}, {} bytes)",
            set.kind,
            set.id,
            set.chain_id,
            set.sequence,
            set.total_size()
        );
        Ok(Committed { set, checks })
    }

    /// Catalog query ordered by creation time, oldest first
    pub fn list(&self, catalog: &Catalog, filter: &SetFilter) -> Vec<BackupSet> {
        let mut sets: Vec<BackupSet> = catalog.sets().filter(|s| filter.matches(s)).cloned().collect();
        sets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sets
    }

    fn check_shape(catalog: &Catalog, staged: &StagedSet) -> BackupResult<()> {
        let has = |role: ArtifactRole| staged.artifacts.iter().any(|a| a.artifact.role == role);
        if !has(ArtifactRole::Database) || !has(ArtifactRole::Filesystem) {
            return Err(BackupError::catalog(format!(
                "set {} needs a database and a filesystem artifact",
                staged.id
            )));
        }

        let lineage_ok = match staged.kind {
            BackupKind::Full => staged.sequence == 0 && staged.chain_id == staged.id,
            BackupKind::Incremental => {
                staged.sequence > 0
                    && catalog
                        .chain_members(&staged.chain_id)
                        .iter()
                        .any(|m| m.sequence == staged.sequence - 1)
            }
        };
        if !lineage_ok {
            return Err(BackupError::catalog(format!(
                "set {} would break chain {} at sequence {}",
                staged.id, staged.chain_id, staged.sequence
            )));
        }
        Ok(())
    }
}
