//! SSH target driven through the `scp` and `ssh` clients

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{tool, RemoteReceipt, RemoteTarget};
use crate::{error::RemoteError, model::SetId};

/// Connection settings for an SSH target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScpConfig {
    /// Remote host
    pub host: String,
    /// Login user
    pub user: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Directory on the remote that holds one subdirectory per set
    pub remote_dir: String,
    /// Private key; the agent or default keys are used when unset
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Uploads sets with `scp -r` and manages them with `ssh`
#[derive(Debug, Clone)]
pub struct ScpTarget {
    name: String,
    config: ScpConfig,
}

impl ScpTarget {
    /// Target named `name`
    pub fn new(name: impl Into<String>, config: ScpConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    fn common_opts(&self, port_flag: &str) -> Vec<String> {
        let mut opts = vec![
            port_flag.to_string(),
            self.config.port.to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
        ];
        if let Some(key) = &self.config.identity_file {
            opts.push("-i".into());
            opts.push(key.display().to_string());
        }
        opts
    }

    fn remote_path(&self, leaf: &str) -> String {
        format!("{}/{}", self.config.remote_dir.trim_end_matches('/'), leaf)
    }

    async fn ssh(&self, script: &str) -> Result<String, RemoteError> {
        let mut args = self.common_opts("-p");
        args.push(self.destination());
        args.push(script.to_string());
        tool::run("ssh", args, &[]).await
    }
}

#[async_trait]
impl RemoteTarget for ScpTarget {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, local_dir), fields(target = %self.name))]
    async fn upload(&self, set_id: &SetId, local_dir: &Path) -> Result<RemoteReceipt, RemoteError> {
        let final_dir = shell_words::quote(&self.remote_path(set_id.as_str())).into_owned();
        let partial = shell_words::quote(&self.remote_path(&format!("{set_id}.partial"))).into_owned();
        let root = shell_words::quote(&self.config.remote_dir).into_owned();

        self.ssh(&format!("mkdir -p {root} && rm -rf {partial}")).await?;

        let mut args = self.common_opts("-P");
        args.push("-r".into());
        args.push(local_dir.display().to_string());
        args.push(format!("{}:{}", self.destination(), partial));
        tool::run("scp", args, &[]).await?;
        debug!("📤 Copied {} to {}", set_id, self.config.host);

        let listing = self
            .ssh(&format!(
                "rm -rf {final_dir} && mv {partial} {final_dir} && find {final_dir} -maxdepth 1 -type f -printf '%f %s\\n'"
            ))
            .await?;
        Ok(RemoteReceipt {
            set_id: set_id.clone(),
            files: tool::parse_name_size_lines(&listing),
        })
    }

    async fn list(&self) -> Result<Vec<SetId>, RemoteError> {
        let root = shell_words::quote(&self.config.remote_dir).into_owned();
        let listing = self
            .ssh(&format!(
                "test -d {root} || exit 0; find {root} -mindepth 1 -maxdepth 1 -type d -printf '%f\\n'"
            ))
            .await?;
        let mut ids: Vec<SetId> = listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.ends_with(".partial"))
            .map(SetId::from)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, set_id: &SetId) -> Result<(), RemoteError> {
        let dir = shell_words::quote(&self.remote_path(set_id.as_str())).into_owned();
        self.ssh(&format!("rm -rf {dir}")).await.map(|_| ())
    }
}
