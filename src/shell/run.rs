//! One-call command execution built on [`ShellProcess`].

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, Weak};

use nix::sys::signal::Signal;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use super::process::{Shared, ShellConfig, ShellProcess, failed_wait_status};
use super::SpawnError;
use crate::console::{self, Message};
use crate::utils::guard::OnDrop;
use crate::utils::sync::lock;

/// Everything a command wrote, and how it ended.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub output: String,
    pub status: ExitStatus,
}

pub struct RunOptions {
    /// Print the command (grey, on a fresh line) before running it.
    pub echo_command: bool,
    /// Copy output to stdout as it streams in.
    pub echo_output: bool,
    pub shell: ShellConfig,
    /// Window-change notifications to follow while the command runs.
    pub window_changes: Option<watch::Receiver<u64>>,
    /// Registry the child is tracked in while it runs.
    pub registry: Option<ChildRegistry>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            echo_command: true,
            echo_output: false,
            shell: ShellConfig::default(),
            window_changes: None,
            registry: None,
        }
    }
}

/// Run `command` to completion and collect its merged output.
pub async fn run(
    command: &str,
    echo_command: bool,
    echo_output: bool,
) -> Result<CommandOutput, SpawnError> {
    run_with(
        command,
        RunOptions {
            echo_command,
            echo_output,
            ..RunOptions::default()
        },
    )
    .await
}

pub async fn run_with(command: &str, options: RunOptions) -> Result<CommandOutput, SpawnError> {
    if options.echo_command {
        console::log(&[Message::grey(format!("\n{command}"))]);
    }

    let collected = Arc::new(Mutex::new(String::new()));
    let sink = {
        let collected = collected.clone();
        let echo = options.echo_output;
        move |text: &str| {
            if echo {
                echo_chunk(text);
            }
            lock(&collected).push_str(text);
        }
    };

    let process = ShellProcess::spawn_with(&options.shell, command, sink)?;
    let pid = process.pid();

    let _untrack = options.registry.map(|registry| {
        registry.track(&process);
        OnDrop::new(move || registry.untrack(pid))
    });
    let _resizes = options
        .window_changes
        .map(|changes| OnDrop::new({
            let follower = process.follow_window_changes(changes);
            move || follower.abort()
        }));

    let (tx, rx) = oneshot::channel();
    process.set_completion(move |status| {
        if tx.send(status).is_err() {
            trace!(pid, "completion receiver already gone");
        }
    });

    let status = match rx.await {
        Ok(status) => status,
        Err(_) => {
            // The reader died without reporting (a panicking sink); nothing
            // drains the pipe any more, so the child cannot finish on its own.
            warn!(pid, "output reader stopped early; killing child");
            if let Err(err) = process.signal(Signal::SIGKILL) {
                warn!(pid, error = %err, "failed to kill child");
            }
            process.wait().unwrap_or_else(|_| failed_wait_status())
        }
    };
    debug!(pid, %status, "command finished");

    let output = std::mem::take(&mut *lock(&collected));
    Ok(CommandOutput { output, status })
}

fn echo_chunk(text: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
        trace!(error = %err, "echoing output to stdout failed");
    }
}

struct Tracked {
    command: String,
    process: Weak<Shared>,
}

/// In-flight children, so shutdown code can stop them.
///
/// Entries hold weak references: a child whose handle is gone, or that has
/// already been reaped, is never signalled.
#[derive(Clone, Default)]
pub struct ChildRegistry {
    children: Arc<Mutex<BTreeMap<u32, Tracked>>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, process: &ShellProcess) {
        let shared = process.shared();
        lock(&self.children).insert(
            shared.pid(),
            Tracked {
                command: shared.command().to_string(),
                process: Arc::downgrade(shared),
            },
        );
    }

    pub fn untrack(&self, pid: u32) {
        lock(&self.children).remove(&pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        lock(&self.children).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.children).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.children).is_empty()
    }

    /// Send `signal` to every tracked child that is still running. Returns
    /// how many were signalled.
    pub fn terminate_all(&self, signal: Signal) -> usize {
        let targets: Vec<(u32, String, Arc<Shared>)> = lock(&self.children)
            .iter()
            .filter_map(|(pid, tracked)| {
                tracked
                    .process
                    .upgrade()
                    .map(|shared| (*pid, tracked.command.clone(), shared))
            })
            .collect();

        let mut signalled = 0;
        for (pid, command, shared) in targets {
            match shared.signal(signal) {
                Ok(()) => {
                    debug!(pid, command = %command, ?signal, "signalled child");
                    signalled += 1;
                }
                Err(err) => warn!(pid, command = %command, error = %err, "failed to signal child"),
            }
        }
        signalled
    }
}

impl std::fmt::Debug for ChildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRegistry")
            .field("pids", &self.pids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_run_echo_hello() {
        let result = run("echo hello", false, false).await.unwrap();
        assert_eq!(result.output, "hello\n");
        assert_eq!(result.status.code(), Some(0));
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let result = run("exit 7", false, false).await.unwrap();
        assert!(result.output.is_empty());
        assert_eq!(result.status.code(), Some(7));
    }

    #[tokio::test]
    async fn test_run_missing_interpreter() {
        let options = RunOptions {
            echo_command: false,
            shell: ShellConfig {
                interpreter: PathBuf::from("/nonexistent/sh"),
                ..ShellConfig::default()
            },
            ..RunOptions::default()
        };
        let err = run_with("echo hi", options).await.unwrap_err();
        assert!(matches!(err, SpawnError::CouldNotSpawn { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let runs = (0..6).map(|n| {
            let command = format!("echo first-{n}; echo second-{n} 1>&2");
            tokio::spawn(async move { (n, run(&command, false, false).await) })
        });

        for handle in runs {
            let (n, result) = handle.await.unwrap();
            let result = result.unwrap();
            assert_eq!(result.output, format!("first-{n}\nsecond-{n}\n"));
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_does_not_stall_the_runtime() {
        // Single-threaded runtime: a blocking drop would freeze the timer
        // below until the child exits.
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            run("sleep 3", false, false),
        )
        .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));

        let ticked = Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ticked.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_registry_tracks_child_only_while_running() {
        let registry = ChildRegistry::new();
        let options = RunOptions {
            echo_command: false,
            registry: Some(registry.clone()),
            ..RunOptions::default()
        };
        run_with("true", options).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_terminates_running_children() {
        let registry = ChildRegistry::new();
        let options = RunOptions {
            echo_command: false,
            registry: Some(registry.clone()),
            ..RunOptions::default()
        };
        let running = tokio::spawn(async move { run_with("exec sleep 30", options).await });

        tokio::time::timeout(Duration::from_secs(10), async {
            while registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.terminate_all(Signal::SIGTERM), 1);

        let result = tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.status.signal(), Some(Signal::SIGTERM as i32));
        assert!(registry.is_empty());
        assert_eq!(registry.terminate_all(Signal::SIGTERM), 0);
    }

    #[tokio::test]
    async fn test_window_changes_are_followed_without_errors() {
        let (tx, rx) = watch::channel(0u64);
        let options = RunOptions {
            echo_command: false,
            window_changes: Some(rx),
            ..RunOptions::default()
        };
        let running = tokio::spawn(async move { run_with("sleep 0.2; echo done", options).await });

        tx.send_modify(|n| *n += 1);
        tx.send_modify(|n| *n += 1);

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.output, "done\n");
    }
}
