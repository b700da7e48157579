//! FTP target driven through `lftp`

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{tool, RemoteReceipt, RemoteTarget};
use crate::{error::RemoteError, model::SetId};

/// Connection settings for an FTP target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtpConfig {
    /// Server host
    pub host: String,
    /// Login user
    pub user: String,
    /// Password, passed to lftp through the environment
    #[serde(default)]
    pub password: String,
    /// Control port
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    /// Directory holding one subdirectory per set
    pub remote_dir: String,
}

fn default_ftp_port() -> u16 {
    21
}

/// Uploads sets with `lftp mirror -R`
#[derive(Debug, Clone)]
pub struct FtpTarget {
    name: String,
    config: FtpConfig,
}

impl FtpTarget {
    /// Target named `name`
    pub fn new(name: impl Into<String>, config: FtpConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn remote_path(&self, leaf: &str) -> String {
        format!("{}/{}", self.config.remote_dir.trim_end_matches('/'), leaf)
    }

    /// Build an lftp script that logs in and runs `commands`
    fn script(&self, commands: &[String]) -> String {
        let mut script = vec![
            "set cmd:fail-exit yes".to_string(),
            "set net:max-retries 1".to_string(),
            format!(
                "open --env-password -u {} -p {} {}",
                shell_words::quote(&self.config.user),
                self.config.port,
                shell_words::quote(&self.config.host)
            ),
        ];
        script.extend_from_slice(commands);
        script.join("; ")
    }

    /// Removal keeps `cmd:fail-exit yes`, so a refused delete fails the call
    fn delete_commands(&self, set_id: &SetId) -> Vec<String> {
        let dir = shell_words::quote(&self.remote_path(set_id.as_str())).into_owned();
        vec![format!("rm -r -f {dir}")]
    }

    async fn lftp(&self, commands: &[String]) -> Result<String, RemoteError> {
        let script = self.script(commands);
        tool::run("lftp", ["-c", script.as_str()], &[("LFTP_PASSWORD", self.config.password.as_str())]).await
    }
}

#[async_trait]
impl RemoteTarget for FtpTarget {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, local_dir), fields(target = %self.name))]
    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError> {
        let root = shell_words::quote(&self.config.remote_dir).into_owned();
        let final_dir = shell_words::quote(&self.remote_path(set_id.as_str())).into_owned();
        let partial = shell_words::quote(&self.remote_path(&format!("{set_id}.partial"))).into_owned();
        let local = shell_words::quote(&local_dir.display().to_string()).into_owned();

        // `rm -f` tolerates missing paths
        self.lftp(&[
            format!("mkdir -p -f {root}"),
            format!("rm -r -f {partial}"),
            format!("rm -r -f {final_dir}"),
            format!("mirror -R --no-perms {local} {partial}"),
            format!("mv {partial} {final_dir}"),
        ])
        .await?;
        debug!("📤 Mirrored {} to {}", set_id, self.config.host);

        let listing = self
            .lftp(&[format!("cls -1 -s --block-size=1 {final_dir}/")])
            .await?;
        Ok(RemoteReceipt {
            set_id: set_id.clone(),
            files: parse_cls_listing(&listing),
        })
    }

    async fn list(&self) -> Result<Vec<SetId>, RemoteError> {
        let root = shell_words::quote(&self.config.remote_dir).into_owned();
        let listing = self.lftp(&[format!("mkdir -p -f {root}"), format!("cls -1 {root}/")]).await?;
        let mut ids: Vec<SetId> = listing
            .lines()
            .filter_map(|l| l.trim().trim_end_matches('/').rsplit('/').next().map(str::to_string))
            .filter(|name| !name.is_empty() && !name.ends_with(".partial"))
            .map(SetId::from)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, set_id: &SetId) -> Result<(), RemoteError> {
        self.lftp(&self.delete_commands(set_id)).await.map(|_| ())
    }
}

/// `cls -s --block-size=1` prints `<size> <path>` per line
fn parse_cls_listing(listing: &str) -> Vec<super::RemoteFile> {
    listing
        .lines()
        .filter_map(|line| {
            let (size, path) = line.trim().split_once(char::is_whitespace)?;
            let name = path.trim().rsplit('/').next()?.to_string();
            Some(super::RemoteFile {
                name,
                size_bytes: size.parse().ok(),
            })
        })
        .collect()
}
