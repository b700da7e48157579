//! S3-compatible object storage through the `aws` CLI

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{tool, RemoteFile, RemoteReceipt, RemoteTarget};
use crate::{error::RemoteError, model::SetId};

/// Bucket settings for an S3 target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// Key prefix under which set ids are stored
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Named CLI profile
    #[serde(default)]
    pub profile: Option<String>,
}

/// Uploads sets with `aws s3 cp --recursive`
#[derive(Debug, Clone)]
pub struct S3Target {
    name: String,
    config: S3Config,
}

impl S3Target {
    /// Target named `name`
    pub fn new(name: impl Into<String>, config: S3Config) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn url(&self, leaf: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("s3://{}/{}", self.config.bucket, leaf)
        } else {
            format!("s3://{}/{}/{}", self.config.bucket, prefix, leaf)
        }
    }

    async fn aws(&self, args: Vec<String>) -> Result<String, RemoteError> {
        let mut full = vec!["s3".to_string()];
        full.extend(args);
        if let Some(endpoint) = &self.config.endpoint_url {
            full.push("--endpoint-url".into());
            full.push(endpoint.clone());
        }
        if let Some(profile) = &self.config.profile {
            full.push("--profile".into());
            full.push(profile.clone());
        }
        full.push("--only-show-errors".into());
        tool::run("aws", full, &[]).await
    }
}

#[async_trait]
impl RemoteTarget for S3Target {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, local_dir), fields(target = %self.name))]
    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError> {
        let dest = self.url(&format!("{set_id}/"));
        self.aws(vec![
            "cp".into(),
            "--recursive".into(),
            local_dir.display().to_string(),
            dest.clone(),
        ])
        .await?;
        debug!("📤 Copied {} to {}", set_id, dest);

        let listing = self.aws(vec!["ls".into(), dest]).await?;
        Ok(RemoteReceipt {
            set_id: set_id.clone(),
            files: parse_object_listing(&listing),
        })
    }

    async fn list(&self) -> Result<Vec<SetId>, RemoteError> {
        let listing = self.aws(vec!["ls".into(), self.url("")]).await;
        // `aws s3 ls` exits 1 when the prefix holds nothing
        let listing = match listing {
            Err(RemoteError::Transient(msg)) if msg.contains("exited with 1:") && msg.ends_with(": ") => {
                String::new()
            }
            other => other?,
        };
        let mut ids: Vec<SetId> = listing
            .lines()
            .filter_map(|l| l.trim().strip_prefix("PRE "))
            .map(|name| SetId::from(name.trim_end_matches('/')))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, set_id: &SetId) -> Result<(), RemoteError> {
        self.aws(vec!["rm".into(), "--recursive".into(), self.url(&format!("{set_id}/"))])
            .await
            .map(|_| ())
    }
}

/// `aws s3 ls` prints `<date> <time> <size> <key>` for objects
fn parse_object_listing(listing: &str) -> Vec<RemoteFile> {
    listing
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                [_, _, size, name] => Some(RemoteFile {
                    name: name.to_string(),
                    size_bytes: size.parse().ok(),
                }),
                _ => None,
            }
        })
        .collect()
}
