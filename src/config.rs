//! Runtime configuration.
//!
//! # Load order
//!
//! 1. Default values
//! 2. Environment variables (`SCRIPTRUN_*`)
//! 3. Command-line flags, applied by the binary
//!
//! An environment value that does not parse is ignored with a warning.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::runloop::RunLoopConfig;
use crate::shell::ShellConfig;

pub const ENV_SHELL: &str = "SCRIPTRUN_SHELL";
pub const ENV_READ_BUFFER: &str = "SCRIPTRUN_READ_BUFFER";
pub const ENV_TICK_MS: &str = "SCRIPTRUN_TICK_MS";
pub const ENV_CLEANUP_TIMEOUT_MS: &str = "SCRIPTRUN_CLEANUP_TIMEOUT_MS";
pub const ENV_LOG: &str = "SCRIPTRUN_LOG";
pub const ENV_LOG_DIR: &str = "SCRIPTRUN_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `warn` or `scriptrun=debug`.
    pub level: String,
    /// Write logs to a per-run file here instead of stderr.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            dir: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = non_empty(lookup(ENV_LOG)).or_else(|| non_empty(lookup("RUST_LOG"))) {
            config.level = level;
        }
        if let Some(dir) = non_empty(lookup(ENV_LOG_DIR)) {
            config.dir = Some(PathBuf::from(dir));
        }
        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub shell: ShellConfig,
    pub run_loop: RunLoopConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults overridden by whatever `lookup` returns
    /// for the `SCRIPTRUN_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            log: LogConfig::from_lookup(&lookup),
            ..Self::default()
        };

        if let Some(shell) = non_empty(lookup(ENV_SHELL)) {
            config.shell.interpreter = PathBuf::from(shell);
        }
        if let Some(bytes) = parse_positive(ENV_READ_BUFFER, lookup(ENV_READ_BUFFER)) {
            config.shell.read_buffer = bytes;
        }
        if let Some(ms) = parse_positive(ENV_TICK_MS, lookup(ENV_TICK_MS)) {
            config.run_loop.tick = Duration::from_millis(ms as u64);
        }
        if let Some(ms) = parse_positive(ENV_CLEANUP_TIMEOUT_MS, lookup(ENV_CLEANUP_TIMEOUT_MS)) {
            config.run_loop.cleanup_timeout = Duration::from_millis(ms as u64);
        }
        config
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_positive(key: &str, value: Option<String>) -> Option<usize> {
    let raw = non_empty(value)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(key, value = %raw, "ignoring invalid environment value; expected a positive integer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.shell.interpreter, PathBuf::from("/bin/sh"));
        assert_eq!(config.shell.read_buffer, 8192);
        assert_eq!(config.run_loop.tick, Duration::from_millis(500));
        assert_eq!(config.run_loop.cleanup_timeout, Duration::from_secs(10));
        assert!(config.run_loop.handle_signals);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::from_lookup(lookup(&[
            (ENV_SHELL, "/bin/bash"),
            (ENV_READ_BUFFER, "4096"),
            (ENV_TICK_MS, "100"),
            (ENV_CLEANUP_TIMEOUT_MS, "2500"),
            (ENV_LOG_DIR, "/tmp/scriptrun-logs"),
        ]));
        assert_eq!(config.shell.interpreter, PathBuf::from("/bin/bash"));
        assert_eq!(config.shell.read_buffer, 4096);
        assert_eq!(config.run_loop.tick, Duration::from_millis(100));
        assert_eq!(config.run_loop.cleanup_timeout, Duration::from_millis(2500));
        assert_eq!(config.log.dir, Some(PathBuf::from("/tmp/scriptrun-logs")));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            (ENV_READ_BUFFER, "lots"),
            (ENV_TICK_MS, "0"),
            (ENV_SHELL, "  "),
        ]));
        assert_eq!(config.shell.read_buffer, 8192);
        assert_eq!(config.run_loop.tick, Duration::from_millis(500));
        assert_eq!(config.shell.interpreter, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_scriptrun_log_wins_over_rust_log() {
        let log = LogConfig::from_lookup(lookup(&[("RUST_LOG", "info"), (ENV_LOG, "debug")]));
        assert_eq!(log.level, "debug");

        let log = LogConfig::from_lookup(lookup(&[("RUST_LOG", "trace")]));
        assert_eq!(log.level, "trace");
    }
}
