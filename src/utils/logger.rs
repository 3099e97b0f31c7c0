//! Logging initialization and configuration.
//!
//! Diagnostics never go to stdout, which belongs to the command being run.
//! Without a log directory they are written to stderr; with one, each run
//! gets its own file, e.g. `logs/scriptrun.2024-12-06-14-30-25.log`.
//!
//! # Configuration
//!
//! The filter comes from [`LogConfig::level`], which is read from
//! `SCRIPTRUN_LOG` (falling back to `RUST_LOG`) and can be overridden with
//! `--log-level`:
//! - `debug` - process lifecycle, signals, cleanup progress
//! - `trace` - every output chunk and run-loop tick
//! - `warn` - failures only (default)

use std::fs;
use std::path::PathBuf;

use anyhow::Context as _;
use chrono::Local;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Install the global subscriber. Returns the log file path when logging to
/// a directory.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<PathBuf>> {
    let (env_filter, rejected) = match EnvFilter::try_new(&config.level) {
        Ok(filter) => (filter, None),
        Err(err) => (EnvFilter::new(LogConfig::default().level), Some(err)),
    };

    let log_path = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            // One file per run: scriptrun.2024-12-06-14-30-25.log
            let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
            let file_name = format!("scriptrun.{timestamp}.log");
            let appender = tracing_appender::rolling::never(dir, &file_name);

            let file_layer = fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .try_init()
                .context("Failed to install log subscriber")?;
            Some(dir.join(file_name))
        }
        None => {
            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .context("Failed to install log subscriber")?;
            None
        }
    };

    if let Some(err) = rejected {
        tracing::warn!(directive = %config.level, error = %err, "invalid log filter; using default");
    }
    if let Some(path) = &log_path {
        tracing::info!("Logging initialized - writing to {}", path.display());
    }
    Ok(log_path)
}
