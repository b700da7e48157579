//! Command line interface
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `CALLVAULT_VERSION_EXTRA` at build time to
/// include it in parenthesis after the SemVer version, e.g. a git commit hash.
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("CALLVAULT_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// Callvault - chain-aware backups for telephony platforms
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "callvault")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "CALLVAULT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter override (trace, debug, info, warn, error or a directive)
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run one backup job
    Run,

    /// Run backups on the configured schedule until interrupted
    Daemon,

    /// List backup sets in the catalog
    List {
        /// Only members of this chain
        #[clap(long)]
        chain: Option<String>,

        /// Only sets older than this many days
        #[clap(long)]
        older_than_days: Option<u32>,

        /// Print JSON instead of a table
        #[clap(long)]
        json: bool,
    },

    /// Recompute checksums of every locally present set
    Verify,

    /// Validate chain lineage and report restorability
    Check,

    /// Apply the retention policy without taking a backup
    Cleanup {
        /// Print the retention plan and change nothing
        #[clap(long)]
        dry_run: bool,
    },
}

/// Parse command line arguments into structured data
pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_list_filters() {
        let args = Args::try_parse_from([
            "callvault",
            "list",
            "--chain",
            "20250601T020000.000Z",
            "--older-than-days",
            "7",
            "--json",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            Commands::List {
                chain: Some("20250601T020000.000Z".into()),
                older_than_days: Some(7),
                json: true,
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["callvault", "cleanup", "--dry-run", "--config", "/tmp/cv.toml", "-l", "debug"])
                .unwrap();
        assert_eq!(args.command, Commands::Cleanup { dry_run: true });
        assert_eq!(args.config, Some(PathBuf::from("/tmp/cv.toml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Args::try_parse_from(["callvault"]).is_err());
    }
}
