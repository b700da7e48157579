//! Configuration loading
//!
//! Defaults, then the TOML file, then `CALLVAULT_` environment variables.
//! Nested keys use a double underscore: `CALLVAULT_BACKUP__HISTORY_DEPTH=3`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use callvault_backup::CallvaultConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::debug;

/// Used when neither `--config` nor `CALLVAULT_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/callvault/callvault.toml";

fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(CallvaultConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CALLVAULT_").ignore(&["config"]).split("__"))
}

/// Load and validate the configuration. A missing file is not an error:
/// defaults and the environment still apply.
pub fn load(path: Option<PathBuf>) -> anyhow::Result<(CallvaultConfig, PathBuf)> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if !path.exists() {
        debug!("📁 {} not found, using defaults", path.display());
    }

    let config: CallvaultConfig = figment(&path)
        .extract()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use callvault_backup::TransportConfig;
    use tempfile::tempdir;

    #[test]
    fn test_toml_sections_and_targets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callvault.toml");
        std::fs::write(
            &path,
            r#"
[backup]
dir = "/srv/backups"
history_depth = 5

[retention]
prune_incomplete_chains = true

[[targets]]
name = "nas"
kind = "local"
path = "/mnt/nas/pbx"

[[targets]]
name = "offsite"
kind = "ftp"
host = "ftp.example.net"
user = "pbx"
password = "secret"
remote_dir = "/backups"
"#,
        )
        .unwrap();

        let (config, loaded_from) = load(Some(path.clone())).unwrap();
        assert_eq!(loaded_from, path);
        assert_eq!(config.backup.dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.backup.history_depth, 5);
        // Untouched keys keep their defaults
        assert_eq!(config.backup.min_free_space_mb, 1024);
        assert!(config.retention.prune_incomplete_chains);
        assert_eq!(config.targets.len(), 2);
        assert!(matches!(&config.targets[1].transport, TransportConfig::Ftp(c) if c.port == 21));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let (config, _) = load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.database.name, "voipnow");
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callvault.toml");
        std::fs::write(&path, "[backup]\nhistory_depth = 0\n").unwrap();
        let err = load(Some(path)).unwrap_err();
        assert!(format!("{err:#}").contains("history_depth"));
    }
}
