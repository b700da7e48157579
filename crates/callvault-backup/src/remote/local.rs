//! Directory mirror target (NFS or USB mount)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{RemoteFile, RemoteReceipt, RemoteTarget};
use crate::{error::RemoteError, model::SetId};

const PARTIAL_SUFFIX: &str = ".partial";

/// Mirrors sets into `<path>/<set id>/`
#[derive(Debug, Clone)]
pub struct LocalTarget {
    name: String,
    root: PathBuf,
}

impl LocalTarget {
    /// Target named `name` writing below `root`
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    async fn read_receipt(&self, set_id: &SetId) -> Result<RemoteReceipt, RemoteError> {
        let dir = self.root.join(set_id.as_str());
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| RemoteError::from_io(&e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| RemoteError::from_io(&e))? {
            let meta = entry.metadata().await.map_err(|e| RemoteError::from_io(&e))?;
            if meta.is_file() {
                files.push(RemoteFile {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size_bytes: Some(meta.len()),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(RemoteReceipt {
            set_id: set_id.clone(),
            files,
        })
    }
}

async fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), dest.join(entry.file_name())).await?;
        }
    }
    Ok(())
}

async fn remove_tree(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl RemoteTarget for LocalTarget {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, local_dir), fields(target = %self.name))]
    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError> {
        let io = |e: std::io::Error| RemoteError::from_io(&e);
        tokio::fs::create_dir_all(&self.root).await.map_err(io)?;

        let final_dir = self.root.join(set_id.as_str());
        let partial = self.root.join(format!("{}{}", set_id, PARTIAL_SUFFIX));
        remove_tree(&partial).await.map_err(io)?;
        copy_dir(local_dir, &partial).await.map_err(io)?;
        remove_tree(&final_dir).await.map_err(io)?;
        tokio::fs::rename(&partial, &final_dir).await.map_err(io)?;

        debug!("💾 Copied {} into {:?}", set_id, final_dir);
        self.read_receipt(set_id).await
    }

    async fn list(&self) -> Result<Vec<SetId>, RemoteError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RemoteError::from_io(&e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| RemoteError::from_io(&e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(PARTIAL_SUFFIX) && entry.path().is_dir() {
                ids.push(SetId::from(name));
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, set_id: &SetId) -> Result<(), RemoteError> {
        remove_tree(&self.root.join(set_id.as_str()))
            .await
            .map_err(|e| RemoteError::from_io(&e))
    }
}
