//! Main entry point for scriptrun.
//!
//! Parses the command line, initializes logging, registers the cleanup that
//! stops in-flight children, and hands the command to the run loop, which
//! exits the process with the command's exit code.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use nix::sys::signal::Signal;
use tracing::{debug, info};

use scriptrun::console::{self, Message, Prompter};
use scriptrun::preferences::Preferences;
use scriptrun::runloop::{RunLoop, RunLoopHandle};
use scriptrun::shell::{self, ChildRegistry, RunOptions, ShellConfig};
use scriptrun::utils;
use scriptrun::{Config, LogConfig};

const PREFERENCES_DOMAIN: &str = "history";
const HISTORY_KEY: &str = "commands";
const HISTORY_LIMIT: usize = 10;

/// Command-line arguments for `scriptrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scriptrun",
    version,
    about = "Run a shell command, stream its output, and clean up on Ctrl-C.",
    long_about = None
)]
struct Cli {
    /// Do not echo the command before running it.
    #[arg(short, long)]
    quiet: bool,

    /// Print the output once the command finishes instead of streaming it.
    #[arg(long)]
    no_stream: bool,

    /// Re-run the most recently remembered command.
    #[arg(long, conflicts_with_all = ["history", "command"])]
    last: bool,

    /// Pick a remembered command from a numbered list.
    #[arg(long, conflicts_with = "command")]
    history: bool,

    /// Remember the command for `--last` and `--history`.
    #[arg(long)]
    remember: bool,

    /// Write logs to a per-run file in this directory instead of stderr.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SCRIPTRUN_LOG`, `RUST_LOG` or `warn` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// The command, run through `/bin/sh -c`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging before anything else
    let mut log = LogConfig::from_env();
    if let Some(level) = cli.log_level {
        log.level = level.directive().to_string();
    }
    if let Some(dir) = &cli.log_dir {
        log.dir = Some(dir.clone());
    }
    if let Err(err) = utils::logger::init_logging(&log) {
        console::elog(&[Message::yellow(format!("Warning: {err:#}"))]);
    }

    let config = Config {
        log,
        ..Config::from_env()
    };
    debug!(?config, "configuration loaded");

    let run_loop = RunLoop::new(config.run_loop.clone());
    let registry = ChildRegistry::new();
    {
        let registry = registry.clone();
        run_loop.defer_task(move || async move {
            let stopped = registry.terminate_all(Signal::SIGTERM);
            if stopped > 0 {
                info!(stopped, "terminated running commands");
            }
            Ok(())
        });
    }

    let shell_config = config.shell;
    run_loop.run(move |handle| run_command(cli, shell_config, registry, handle))
}

async fn run_command(
    cli: Cli,
    shell_config: ShellConfig,
    registry: ChildRegistry,
    handle: RunLoopHandle,
) -> Result<i32> {
    let Some(command) = resolve_command(&cli).await? else {
        return Ok(0);
    };

    let options = RunOptions {
        echo_command: !cli.quiet,
        echo_output: !cli.no_stream,
        shell: shell_config,
        window_changes: Some(handle.window_changes()),
        registry: Some(registry),
    };
    let result = shell::run_with(&command, options)
        .await
        .with_context(|| format!("Failed to run `{command}`"))?;

    if cli.no_stream {
        console::logf(&[Message::plain(&result.output)]);
    }
    if cli.remember {
        remember(command).await?;
    }

    let code = exit_code(result.status);
    debug!(code, status = %result.status, "command exit code");
    Ok(code)
}

/// Decide what to run: the positional command, or one picked from history.
/// `None` means the user declined.
async fn resolve_command(cli: &Cli) -> Result<Option<String>> {
    if !cli.last && !cli.history {
        let command = cli.command.join(" ");
        if command.trim().is_empty() {
            anyhow::bail!("No command given (see --help)");
        }
        return Ok(Some(command));
    }

    let last = cli.last;
    // Prompts block on stdin.
    tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        let history = load_history()?;
        let mut prompter = Prompter::stdio();
        if last {
            let Some(command) = history.first() else {
                anyhow::bail!("No remembered command yet (use --remember)");
            };
            let again = prompter.confirm(format!("Run `{command}` again?"), true)?;
            return Ok(again.then(|| command.clone()));
        }
        if history.is_empty() {
            anyhow::bail!("No remembered commands yet (use --remember)");
        }
        Ok(prompter.select("Pick a command to run:", &history)?)
    })
    .await
    .context("Prompt task failed")?
}

fn load_history() -> Result<Vec<String>> {
    let prefs = Preferences::open(PREFERENCES_DOMAIN)?;
    Ok(prefs.get_strings(HISTORY_KEY).unwrap_or_default())
}

async fn remember(command: String) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut prefs = Preferences::open(PREFERENCES_DOMAIN)?;
        let mut history = prefs.get_strings(HISTORY_KEY).unwrap_or_default();
        history.retain(|previous| *previous != command);
        history.insert(0, command);
        history.truncate(HISTORY_LIMIT);
        prefs.set_strings(HISTORY_KEY, &history)?;
        Ok(())
    })
    .await
    .context("Saving history failed")?
}

/// The shell convention: the exit code, or 128 + signal number when the
/// command was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}
