//! Logging setup
//!
//! Console output on stderr plus an optional daily rolling file.
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.1.0
//! Date: 2025-06-15

use callvault_backup::LoggingConfig;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter precedence: `--log-level`, then `RUST_LOG`, then the configured
/// level. Unparsable directives fall back to `warn`.
fn env_filter(config: &LoggingConfig, cli_level: Option<&str>) -> EnvFilter {
    let from_env = || EnvFilter::try_from_default_env().ok();
    let directive = match cli_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => from_env().or_else(|| EnvFilter::try_new(&config.level).ok()),
    };
    directive.unwrap_or_else(|| EnvFilter::new("warn"))
}

fn console_layer(json: bool) -> BoxedLayer {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(config: &LoggingConfig, cli_level: Option<&str>) -> anyhow::Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.json)];

    let guard = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(directory, "callvault.log"));
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            layers.push(if config.json { layer.json().boxed() } else { layer.boxed() });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(config, cli_level))
        .try_init()?;
    Ok(guard)
}
