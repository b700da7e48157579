// =============================================================================
// Callvault - Main Entry Point
// =============================================================================
//
// Project: Callvault - chain-aware backups for telephony platforms
// Author: arkSong (arksong2018@gmail.com)
// Date: 2025-06-15
// Version: 0.1.0
// License: Apache 2.0 / MIT
//
// Description:
//   Command line entry point. Loads configuration (TOML + CALLVAULT_ env),
//   installs logging, wires Ctrl-C to the run's cancellation token and
//   dispatches to the subcommand handlers.
//
// =============================================================================

use std::process::ExitCode;

use callvault_backup::RunContext;
use tracing::{error, info, warn};

mod clap;
mod commands;
mod config;
mod logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = clap::parse();

    let (config, config_path) = match config::load(args.config.clone()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match logging::init(&config.logging, args.log_level.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    info!("🚀 Callvault {} using {}", clap::version(), config_path.display());

    let ctx = RunContext::new(config);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Interrupt received, cancelling");
                cancel.cancel();
            }
            Err(e) => error!("❌ Cannot listen for Ctrl-C: {}", e),
        }
    });

    let result = match args.command {
        clap::Commands::Run => commands::run(ctx).await,
        clap::Commands::Daemon => commands::daemon(ctx).await,
        clap::Commands::List {
            chain,
            older_than_days,
            json,
        } => commands::list(ctx, chain, older_than_days, json).await,
        clap::Commands::Verify => commands::verify(ctx).await,
        clap::Commands::Check => commands::check(ctx).await,
        clap::Commands::Cleanup { dry_run } => commands::cleanup(ctx, dry_run).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
