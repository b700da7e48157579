//! Artifact producers
//!
//! The database dump and the filesystem snapshot are produced by external
//! tools. Both write into the staging directory of the set being built.
//! The pipeline seals each artifact as soon as its producer returns it.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncReadExt, process::Command};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BackupError, BackupResult, SnapshotError},
    model::{ArtifactRole, BackupKind},
    utils::gzip_stream_to_file,
};

/// File name of the filesystem archive inside a set
pub const ARCHIVE_NAME: &str = "files.tar.gz";
/// File name of the tar snapshot state inside a set
pub const SNAPSHOT_INDEX_NAME: &str = "files.snar";

/// A file written by a producer, before it is sealed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArtifact {
    /// Location in the staging directory
    pub path: PathBuf,
    /// What the file holds
    pub role: ArtifactRole,
}

/// Produces a consistent database dump
#[async_trait]
pub trait DumpProducer: Send + Sync + fmt::Debug {
    /// Write the dump into `dest_dir`
    async fn produce(&self, dest_dir: &Path) -> BackupResult<ProducedArtifact>;
}

/// What the snapshotter is asked to produce
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest<'a> {
    /// Full or incremental
    pub kind: BackupKind,
    /// Staging directory of the new set
    pub dest_dir: &'a Path,
    /// Directory of the set an incremental is diffed against
    pub reference_dir: Option<&'a Path>,
}

/// Produces a full or delta filesystem archive
#[async_trait]
pub trait FilesystemSnapshotter: Send + Sync + fmt::Debug {
    /// Write the snapshot artifacts into `request.dest_dir`
    async fn snapshot(&self, request: SnapshotRequest<'_>) -> Result<Vec<ProducedArtifact>, SnapshotError>;
}

/// Database dump settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name, used in the artifact name
    pub name: String,
    /// Dump command and arguments; stdout is the dump
    pub command: Vec<String>,
    /// `type:user:password` credentials file
    pub credentials_file: Option<PathBuf>,
    /// gzip level (0-9)
    pub compression_level: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "voipnow".into(),
            command: ["mysqldump", "--single-transaction", "--routines", "--triggers", "voipnow"]
                .map(String::from)
                .to_vec(),
            credentials_file: Some(PathBuf::from("/etc/voipnow/.sqldb")),
            compression_level: 6,
        }
    }
}

/// Database login read from the platform credentials file
#[derive(Clone, PartialEq, Eq)]
pub struct DbCredentials {
    /// Server type, e.g. `mysql`
    pub kind: String,
    /// Login user
    pub user: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("kind", &self.kind)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl DbCredentials {
    /// Parse `type:user:password`; the password may itself contain `:`
    pub fn parse(content: &str) -> Option<Self> {
        let line = content.lines().find(|l| !l.trim().is_empty())?.trim();
        let mut parts = line.splitn(3, ':');
        let kind = parts.next()?.to_string();
        let user = parts.next()?.to_string();
        let password = parts.next()?.to_string();
        if user.is_empty() {
            return None;
        }
        Some(Self { kind, user, password })
    }
}

/// Runs a dump command and gzips its stdout
#[derive(Debug, Clone)]
pub struct CommandDumpProducer {
    config: DatabaseConfig,
}

impl CommandDumpProducer {
    /// Producer for the configured command
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    /// Name of the dump artifact
    pub fn artifact_name(&self) -> String {
        format!("db-{}.sql.gz", self.config.name)
    }

    async fn credentials(&self) -> BackupResult<Option<DbCredentials>> {
        let Some(path) = &self.config.credentials_file else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => DbCredentials::parse(&content).map(Some).ok_or_else(|| {
                BackupError::DumpFailed(format!("malformed credentials file {}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credentials file at {:?}, relying on client defaults", path);
                Ok(None)
            }
            Err(e) => Err(BackupError::DumpFailed(format!("{}: {}", path.display(), e))),
        }
    }
}

#[async_trait]
impl DumpProducer for CommandDumpProducer {
    #[instrument(skip(self), fields(database = %self.config.name))]
    async fn produce(&self, dest_dir: &Path) -> BackupResult<ProducedArtifact> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(BackupError::config("database.command is empty"));
        };
        info!("💾 Dumping database {}", self.config.name);

        let mut cmd = Command::new(program);
        if let Some(creds) = self.credentials().await? {
            cmd.arg(format!("--user={}", creds.user));
            cmd.env("MYSQL_PWD", &creds.password);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackupError::DumpFailed(format!("cannot start {}: {}", program, e)))?;
        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BackupError::DumpFailed("dump process has no output pipes".into()));
        };

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let dest = dest_dir.join(self.artifact_name());
        let level = self.config.compression_level;
        let gzip_dest = dest.clone();
        let reader = SyncIoBridge::new(stdout);
        let written = tokio::task::spawn_blocking(move || gzip_stream_to_file(reader, &gzip_dest, level))
            .await
            .map_err(|e| BackupError::DumpFailed(format!("compression task failed: {}", e)))??;

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::DumpFailed(format!(
                "{} exited with {}: {}",
                program,
                status,
                stderr.trim()
            )));
        }
        if written == 0 {
            return Err(BackupError::DumpFailed(format!("{} produced no output", program)));
        }

        info!("✅ Database dump written ({} bytes uncompressed)", written);
        Ok(ProducedArtifact {
            path: dest,
            role: ArtifactRole::Database,
        })
    }
}

/// Filesystem snapshot settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Trees to archive
    pub paths: Vec<PathBuf>,
    /// `--exclude` patterns passed to tar
    pub exclude: Vec<String>,
    /// GNU tar binary
    pub tar_command: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("/etc/voipnow"), PathBuf::from("/var/lib/voipnow")],
            exclude: vec!["*.tmp".into()],
            tar_command: "tar".into(),
        }
    }
}

/// GNU tar `--listed-incremental` snapshots
#[derive(Debug, Clone)]
pub struct TarSnapshotter {
    config: FilesystemConfig,
}

impl TarSnapshotter {
    /// Snapshotter for the configured trees
    pub fn new(config: FilesystemConfig) -> Self {
        Self { config }
    }

    fn tar_args(&self, archive: &Path, snar: &Path) -> Vec<String> {
        let mut args = vec![
            "--create".to_string(),
            "--gzip".into(),
            format!("--file={}", archive.display()),
            format!("--listed-incremental={}", snar.display()),
            "--ignore-failed-read".into(),
        ];
        args.extend(self.config.exclude.iter().map(|p| format!("--exclude={p}")));
        args.extend(self.config.paths.iter().map(|p| p.display().to_string()));
        args
    }
}

#[async_trait]
impl FilesystemSnapshotter for TarSnapshotter {
    #[instrument(skip(self, request), fields(kind = %request.kind))]
    async fn snapshot(&self, request: SnapshotRequest<'_>) -> Result<Vec<ProducedArtifact>, SnapshotError> {
        if self.config.paths.is_empty() {
            return Err(SnapshotError::Failed("filesystem.paths is empty".into()));
        }

        let archive = request.dest_dir.join(ARCHIVE_NAME);
        let snar = request.dest_dir.join(SNAPSHOT_INDEX_NAME);
        let _ = tokio::fs::remove_file(&snar).await;

        if request.kind == BackupKind::Incremental {
            let reference = request
                .reference_dir
                .map(|d| d.join(SNAPSHOT_INDEX_NAME))
                .ok_or_else(|| SnapshotError::CannotDiff("no reference set given".into()))?;
            if let Err(e) = tokio::fs::copy(&reference, &snar).await {
                return Err(SnapshotError::CannotDiff(format!("{}: {}", reference.display(), e)));
            }
        }

        info!("📦 Archiving {} path(s) ({})", self.config.paths.len(), request.kind);
        let output = Command::new(&self.config.tar_command)
            .args(self.tar_args(&archive, &snar))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SnapshotError::Failed(format!("cannot start {}: {}", self.config.tar_command, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => {}
            // GNU tar: some files changed while being read
            Some(1) => warn!("⚠️ tar reported changed files: {}", stderr.trim()),
            _ if request.kind == BackupKind::Incremental && stderr.contains(SNAPSHOT_INDEX_NAME) => {
                return Err(SnapshotError::CannotDiff(stderr.trim().to_string()));
            }
            _ => {
                return Err(SnapshotError::Failed(format!(
                    "{} exited with {}: {}",
                    self.config.tar_command,
                    output.status,
                    stderr.trim()
                )));
            }
        }

        Ok(vec![
            ProducedArtifact {
                path: archive,
                role: ArtifactRole::Filesystem,
            },
            ProducedArtifact {
                path: snar,
                role: ArtifactRole::SnapshotIndex,
            },
        ])
    }
}
