//! Integrity verification
//!
//! Checksums are taken once when the producer closes an artifact ("seal")
//! and recomputed before commit. A mismatch means the file changed between
//! production and commit: truncated write, disk error, concurrent tamper.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, instrument, warn};

use crate::{
    catalog::Catalog,
    error::BackupResult,
    model::{Artifact, ArtifactRole, SetId},
    utils::BackupLayout,
};

/// An artifact checksummed at close time, not yet committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedArtifact {
    /// Location on disk
    pub path: PathBuf,
    /// Catalog record
    pub artifact: Artifact,
}

/// Outcome of re-checking one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCheck {
    /// Artifact name
    pub name: String,
    /// Whether size and checksum matched
    pub matches: bool,
    /// Explanation when it did not
    pub detail: Option<String>,
}

/// Computes and checks content checksums
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Hex SHA-256 and byte length of a file
    pub async fn checksum(path: &Path) -> BackupResult<(String, u64)> {
        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0; 64 * 1024];
        let mut len = 0u64;

        loop {
            let bytes_read = file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            len += bytes_read as u64;
        }

        Ok((format!("{:x}", hasher.finalize()), len))
    }

    /// Checksum an artifact the moment its producer closed it
    #[instrument(level = "debug")]
    pub async fn seal(path: &Path, role: ArtifactRole) -> BackupResult<SealedArtifact> {
        let (checksum, size_bytes) = Self::checksum(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("🔏 Sealed {} ({} bytes, sha256 {})", name, size_bytes, checksum);
        Ok(SealedArtifact {
            path: path.to_path_buf(),
            artifact: Artifact {
                name,
                role,
                size_bytes,
                checksum,
            },
        })
    }

    /// Recompute the checksum of `path` and compare it with the sealed record
    pub async fn verify(path: &Path, expected: &Artifact) -> ArtifactCheck {
        let (matches, detail) = match Self::checksum(path).await {
            Ok((_, size)) if size != expected.size_bytes => (
                false,
                Some(format!("size {} != sealed size {}", size, expected.size_bytes)),
            ),
            Ok((checksum, _)) if checksum != expected.checksum => {
                (false, Some(format!("checksum {} != sealed {}", checksum, expected.checksum)))
            }
            Ok(_) => (true, None),
            Err(e) => (false, Some(format!("unreadable: {}", e))),
        };

        if !matches {
            warn!("❌ Artifact {} failed verification: {:?}", expected.name, detail);
        }
        ArtifactCheck {
            name: expected.name.clone(),
            matches,
            detail,
        }
    }

    /// Verify every artifact in `dir`; the set is verified iff all match
    pub async fn verify_all(dir: &Path, artifacts: &[Artifact]) -> Vec<ArtifactCheck> {
        let mut checks = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            checks.push(Self::verify(&dir.join(&artifact.name), artifact).await);
        }
        checks
    }
}

/// Re-verification result for one committed set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVerification {
    /// Set checked
    pub set_id: SetId,
    /// Per-artifact results
    pub checks: Vec<ArtifactCheck>,
}

impl SetVerification {
    /// Whether every artifact still matches
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.matches)
    }
}

/// Recompute the checksums of every locally present set. A set that no
/// longer matches is flagged `verified = false`, which stops its chain from
/// being extended or counted as restorable. The catalog is saved when
/// anything changed.
#[instrument(skip_all)]
pub async fn verify_catalog(catalog: &mut Catalog, layout: &BackupLayout) -> BackupResult<Vec<SetVerification>> {
    let targets: Vec<(SetId, Vec<Artifact>)> = catalog
        .sets()
        .filter(|s| s.locally_present)
        .map(|s| (s.id.clone(), s.artifacts.clone()))
        .collect();

    let mut results = Vec::with_capacity(targets.len());
    let mut changed = false;
    for (set_id, artifacts) in targets {
        let checks = IntegrityVerifier::verify_all(&layout.set_dir(&set_id), &artifacts).await;
        let result = SetVerification { set_id, checks };
        if let Some(set) = catalog.get_mut(&result.set_id) {
            if set.verified != result.passed() {
                set.verified = result.passed();
                changed = true;
            }
        }
        results.push(result);
    }

    if changed {
        catalog.save().await?;
    }
    debug!("🔍 Re-verified {} sets", results.len());
    Ok(results)
}
