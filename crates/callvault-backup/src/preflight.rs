//! Free space check before producing a set

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, info};

use crate::{
    catalog::Catalog,
    error::{BackupError, BackupResult},
    model::BackupKind,
};

/// Bytes the next set needs: the configured floor, or the size of the most
/// recent Full if that is larger.
pub fn required_bytes(catalog: &Catalog, min_free_space_mb: u64) -> u64 {
    let floor = min_free_space_mb.saturating_mul(1024 * 1024);
    let last_full = catalog
        .sets()
        .rev()
        .find(|s| s.kind == BackupKind::Full)
        .map(|s| s.total_size())
        .unwrap_or(0);
    floor.max(last_full)
}

/// Available bytes on the filesystem holding `path`
pub fn available_bytes(path: &Path) -> Option<u64> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Fail with `SpacePreflightFailed` when the destination cannot hold a new set
pub fn check_space(path: &Path, required: u64) -> BackupResult<()> {
    let Some(available) = available_bytes(path) else {
        debug!("No mounted filesystem found for {:?}, skipping space check", path);
        return Ok(());
    };
    check_available(path.to_path_buf(), available, required)
}

fn check_available(path: PathBuf, available: u64, required: u64) -> BackupResult<()> {
    if available < required {
        return Err(BackupError::SpacePreflightFailed {
            path,
            available,
            required,
        });
    }
    info!(
        "💽 {} MB free on backup destination ({} MB required)",
        available / (1024 * 1024),
        required / (1024 * 1024)
    );
    Ok(())
}
