//! Utility functions for callvault backup operations
//!
//! Directory layout of the backup destination, atomic writes and gzip
//! streaming used by the dump producer.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use tracing::{debug, info, warn};

use crate::{error::BackupError, model::SetId};

/// Paths inside the backup destination directory
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    /// Layout rooted at the configured backup directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Backup destination root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Catalog document
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    /// Run lock file
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("run.lock")
    }

    /// Parent of in-progress set directories
    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Directory a set is produced into before commit
    pub fn staging_dir(&self, id: &SetId) -> PathBuf {
        self.staging_root().join(id.as_str())
    }

    /// Parent of committed set directories
    pub fn sets_root(&self) -> PathBuf {
        self.root.join("sets")
    }

    /// Directory holding a committed set's artifacts
    pub fn set_dir(&self, id: &SetId) -> PathBuf {
        self.sets_root().join(id.as_str())
    }

    /// Create the layout and check it is writable
    pub fn prepare(&self) -> Result<(), BackupError> {
        validate_backup_dir(&self.root)?;
        fs::create_dir_all(self.staging_root())?;
        fs::create_dir_all(self.sets_root())?;
        Ok(())
    }
}

/// Validate and create backup directory if needed
pub fn validate_backup_dir(path: &Path) -> Result<(), BackupError> {
    if !path.exists() {
        info!("📂 Creating backup directory at {:?}", path);
        fs::create_dir_all(path)?;
    } else if !path.is_dir() {
        return Err(BackupError::config(format!(
            "Backup path is not a directory: {}",
            path.display()
        )));
    }

    // Check write permissions
    let test_file = path.join(".permission_test");
    fs::write(&test_file, "test")?;
    fs::remove_file(&test_file)?;

    Ok(())
}

/// Write a file by writing a sibling temp file and renaming it over the target
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), BackupError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, contents).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Remove a directory tree; a missing directory is not an error
pub async fn remove_dir_if_exists(path: &Path) -> Result<bool, BackupError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("🗑 Removed {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Stream a reader into a gzip file, returning the uncompressed byte count
pub fn gzip_stream_to_file(
    mut reader: impl Read,
    dest_path: &Path,
    compression_level: u32,
) -> Result<u64, BackupError> {
    let dest_file = fs::File::create(dest_path)?;
    let mut encoder = GzEncoder::new(dest_file, Compression::new(compression_level.min(9)));
    let mut buffer = [0; 64 * 1024];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        encoder.write_all(&buffer[..bytes_read])?;
        total += bytes_read as u64;
    }

    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(total)
}

/// Remove staging directories left behind by runs that never committed
pub async fn sweep_staging(layout: &BackupLayout) -> Result<Vec<PathBuf>, BackupError> {
    let mut removed = Vec::new();
    let mut dir = match tokio::fs::read_dir(layout.staging_root()).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        warn!("🧹 Discarding uncommitted staging directory {:?}", path);
        if remove_dir_if_exists(&path).await? {
            removed.push(path);
        }
    }
    Ok(removed)
}
