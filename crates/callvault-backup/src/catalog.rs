//! Persistent catalog of backup sets
//!
//! The catalog is the only state carried between runs. It is a single JSON
//! document rewritten atomically after every mutation batch.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BackupError, BackupResult},
    model::{BackupSet, SetId},
    utils::write_atomic,
};

const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogState {
    version: u32,
    sets: BTreeMap<SetId, BackupSet>,
    #[serde(default)]
    abandoned_chains: BTreeMap<SetId, String>,
}

/// Ordered collection of all known backup sets
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    state: CatalogState,
}

impl Catalog {
    /// Create an empty catalog that will be saved at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: CatalogState {
                version: CATALOG_VERSION,
                ..Default::default()
            },
        }
    }

    /// Load the catalog, or start an empty one if the file does not exist yet
    #[instrument(level = "debug")]
    pub async fn load(path: &Path) -> BackupResult<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("📂 No catalog at {:?}, starting empty", path);
                return Ok(Self::new(path));
            }
            Err(e) => return Err(e.into()),
        };

        let state: CatalogState = serde_json::from_str(&content)
            .map_err(|e| BackupError::catalog(format!("{}: {}", path.display(), e)))?;
        if state.version > CATALOG_VERSION {
            return Err(BackupError::catalog(format!(
                "catalog version {} is newer than supported version {}",
                state.version, CATALOG_VERSION
            )));
        }

        debug!("📂 Loaded {} backup sets from catalog", state.sets.len());
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Persist the catalog atomically
    pub async fn save(&self) -> BackupResult<()> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json).await?;
        debug!("💾 Catalog saved ({} sets)", self.state.sets.len());
        Ok(())
    }

    /// Path of the catalog file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of sets known
    pub fn len(&self) -> usize {
        self.state.sets.len()
    }

    /// Whether no set was ever recorded
    pub fn is_empty(&self) -> bool {
        self.state.sets.is_empty()
    }

    /// Record a set. Committing new backups goes through the set manager;
    /// this is also used when importing or seeding catalogs.
    pub fn insert(&mut self, set: BackupSet) {
        self.state.sets.insert(set.id.clone(), set);
    }

    pub(crate) fn remove(&mut self, id: &SetId) -> Option<BackupSet> {
        self.state.sets.remove(id)
    }

    /// Look up a set
    pub fn get(&self, id: &SetId) -> Option<&BackupSet> {
        self.state.sets.get(id)
    }

    /// Look up a set for mutation
    pub fn get_mut(&mut self, id: &SetId) -> Option<&mut BackupSet> {
        self.state.sets.get_mut(id)
    }

    /// All sets, oldest first
    pub fn sets(&self) -> impl DoubleEndedIterator<Item = &BackupSet> {
        self.state.sets.values()
    }

    /// Most recently created set
    pub fn latest(&self) -> Option<&BackupSet> {
        self.state.sets.values().next_back()
    }

    /// Members of a chain, ordered by sequence
    pub fn chain_members(&self, chain_id: &SetId) -> Vec<&BackupSet> {
        let mut members: Vec<&BackupSet> = self
            .state
            .sets
            .values()
            .filter(|s| &s.chain_id == chain_id)
            .collect();
        members.sort_by_key(|s| s.sequence);
        members
    }

    /// Distinct chain ids, oldest chain first
    pub fn chain_ids(&self) -> Vec<SetId> {
        let ids: BTreeSet<&SetId> = self.state.sets.values().map(|s| &s.chain_id).collect();
        ids.into_iter().cloned().collect()
    }

    /// Mark a chain as never to be extended again
    pub fn mark_abandoned(&mut self, chain_id: &SetId, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("⛓️ Chain {} abandoned: {}", chain_id, reason);
        self.state.abandoned_chains.insert(chain_id.clone(), reason);
    }

    /// Reason a chain was abandoned, if it was
    pub fn abandoned_reason(&self, chain_id: &SetId) -> Option<&str> {
        self.state.abandoned_chains.get(chain_id).map(String::as_str)
    }

    /// Allocate the id for a new set. Ids stay strictly increasing even if
    /// the clock steps backwards between runs.
    pub fn next_id(&self, now: DateTime<Utc>) -> (SetId, DateTime<Utc>) {
        let created_at = match self.latest() {
            Some(last) if last.created_at >= now => last.created_at + Duration::milliseconds(1),
            _ => now,
        };
        (SetId::from_timestamp(created_at), created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::set_at;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_catalog_loads_empty_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let mut catalog = Catalog::load(&path).await.unwrap();
        assert!(catalog.is_empty());

        let full = set_at(Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap(), None, 0);
        catalog.insert(full.clone());
        catalog.mark_abandoned(&full.id, "reference snapshot missing");
        catalog.save().await.unwrap();

        let reloaded = Catalog::load(&path).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&full.id), Some(&full));
        assert_eq!(
            reloaded.abandoned_reason(&full.id),
            Some("reference snapshot missing")
        );
    }

    #[test]
    fn next_id_is_monotonic_when_clock_goes_back() {
        let mut catalog = Catalog::new("/nonexistent/catalog.json");
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap();
        catalog.insert(set_at(t, None, 0));

        let (id, created_at) = catalog.next_id(t - Duration::hours(1));
        assert!(id > catalog.latest().unwrap().id);
        assert_eq!(created_at, t + Duration::milliseconds(1));
    }

    #[test]
    fn chain_members_are_ordered_by_sequence() {
        let mut catalog = Catalog::new("/nonexistent/catalog.json");
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap();
        let full = set_at(t, None, 0);
        let inc1 = set_at(t + Duration::days(1), Some(&full.id), 1);
        let inc2 = set_at(t + Duration::days(2), Some(&full.id), 2);
        catalog.insert(inc2.clone());
        catalog.insert(full.clone());
        catalog.insert(inc1.clone());

        let seqs: Vec<u32> = catalog.chain_members(&full.id).iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(catalog.chain_ids(), vec![full.id.clone()]);
        assert_eq!(catalog.latest().map(|s| &s.id), Some(&inc2.id));
    }
}
