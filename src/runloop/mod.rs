//! Top-level run loop.
//!
//! A [`RunLoop`] owns the single asynchronous task of the program, the
//! deferred cleanup list and the signal subscriptions. [`RunLoop::run`] drives
//! the task on a multi-threaded tokio runtime until it finishes or an
//! interrupt arrives, runs the cleanups exactly once, and exits the process:
//!
//! ```text
//! Idle -> Running -> {Completed, Interrupted} -> CleaningUp -> Exited
//! ```
//!
//! Exit codes: the task's own code on success, 1 on a task error, 0 on
//! interrupt.

mod cleanup;
mod signals;

use std::future::Future;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

pub use cleanup::{CleanupFuture, CleanupList, CleanupReport};

use crate::console::{self, Message};
use crate::preferences::{AccessError, PreferencesError};
use crate::utils::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Interrupted,
    CleaningUp,
    Exited,
}

/// What ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The task returned (successfully or not).
    Completed,
    /// SIGINT, or [`RunLoopHandle::interrupt`].
    Interrupted,
    /// [`RunLoopHandle::request_exit`].
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub code: i32,
    pub reason: ExitReason,
}

#[derive(Debug, Clone)]
pub struct RunLoopConfig {
    /// How often the dispatch loop wakes when nothing happens.
    pub tick: Duration,
    /// Upper bound for each deferred cleanup action.
    pub cleanup_timeout: Duration,
    /// Subscribe to SIGINT and SIGWINCH. Off in tests that drive events
    /// through a [`RunLoopHandle`] instead.
    pub handle_signals: bool,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            cleanup_timeout: Duration::from_secs(10),
            handle_signals: true,
        }
    }
}

/// Notifications handled by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopEvent {
    Interrupt,
    WindowChanged,
    Exit(i32),
}

struct Inner {
    cleanups: CleanupList,
    state: Mutex<RunState>,
    events: mpsc::UnboundedSender<LoopEvent>,
    /// Bumped once per window-size change.
    window: watch::Sender<u64>,
}

impl Inner {
    fn state(&self) -> RunState {
        *lock(&self.state)
    }

    fn set_state(&self, next: RunState) {
        let mut state = lock(&self.state);
        debug!(from = ?*state, to = ?next, "run loop state");
        *state = next;
    }

    fn post(&self, event: LoopEvent) {
        if self.events.send(event).is_err() {
            debug!(?event, "run loop already finished; event dropped");
        }
    }
}

pub struct RunLoop {
    config: RunLoopConfig,
    inner: Arc<Inner>,
    events: mpsc::UnboundedReceiver<LoopEvent>,
}

impl RunLoop {
    pub fn new(config: RunLoopConfig) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (window, _) = watch::channel(0);
        Self {
            config,
            inner: Arc::new(Inner {
                cleanups: CleanupList::new(),
                state: Mutex::new(RunState::Idle),
                events: events_tx,
                window,
            }),
            events,
        }
    }

    pub fn handle(&self) -> RunLoopHandle {
        RunLoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// Register a cleanup action. Actions run in registration order.
    pub fn defer_task<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.cleanups.push(action)
    }

    pub fn state(&self) -> RunState {
        self.inner.state()
    }

    /// Drive `task` on a fresh multi-threaded runtime, then exit the process
    /// with the resulting code.
    ///
    /// The process exits while the runtime is still alive: a task left
    /// pending by an interrupt is never dropped, so nothing it owns can hold
    /// up the exit.
    pub fn run<F, Fut>(self, task: F) -> !
    where
        F: FnOnce(RunLoopHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<i32>> + Send + 'static,
    {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "failed to start async runtime");
                console::elog(&[Message::red(format!("Error: {err}"))]);
                exit_now(1)
            }
        };
        let termination = runtime.block_on(self.drive(task));
        exit_now(termination.code)
    }

    /// Run `task` until it finishes or the loop is interrupted, then run the
    /// deferred cleanups once. Does not exit the process.
    pub async fn drive<F, Fut>(mut self, task: F) -> Termination
    where
        F: FnOnce(RunLoopHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<i32>> + Send + 'static,
    {
        let _signals = if self.config.handle_signals {
            match signals::forward(self.inner.events.clone()) {
                Ok(forwarders) => Some(forwarders),
                Err(err) => {
                    warn!(error = %err, "could not install signal handlers");
                    None
                }
            }
        } else {
            None
        };

        self.inner.set_state(RunState::Running);
        let mut task = tokio::spawn(task(self.handle()));

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (code, reason) = loop {
            tokio::select! {
                joined = &mut task => {
                    self.inner.set_state(RunState::Completed);
                    break (exit_code(joined), ExitReason::Completed);
                }
                Some(event) = self.events.recv() => match event {
                    LoopEvent::Interrupt => {
                        self.inner.set_state(RunState::Interrupted);
                        if !self.inner.cleanups.is_empty() {
                            console::log(&[Message::grey("\nPerforming cleanup...")]);
                        }
                        break (0, ExitReason::Interrupted);
                    }
                    LoopEvent::WindowChanged => {
                        self.inner.window.send_modify(|generation| {
                            *generation = generation.wrapping_add(1);
                        });
                    }
                    LoopEvent::Exit(code) => {
                        self.inner.set_state(RunState::Completed);
                        break (code, ExitReason::Requested);
                    }
                },
                _ = ticker.tick() => trace!("run loop tick"),
            }
        };

        self.inner.set_state(RunState::CleaningUp);
        if let Some(report) = self
            .inner
            .cleanups
            .run_once(self.config.cleanup_timeout)
            .await
        {
            debug!(
                succeeded = report.succeeded,
                failed = report.failed,
                timed_out = report.timed_out,
                "deferred cleanup finished"
            );
        }
        self.inner.set_state(RunState::Exited);

        debug!(code, ?reason, "run loop finished");
        Termination { code, reason }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new(RunLoopConfig::default())
    }
}

/// Cloneable access to a [`RunLoop`] from inside the task.
#[derive(Clone)]
pub struct RunLoopHandle {
    inner: Arc<Inner>,
}

impl RunLoopHandle {
    /// See [`RunLoop::defer_task`]. Returns `false` once cleanup started.
    pub fn defer_task<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.cleanups.push(action)
    }

    /// Post the same event a SIGINT posts.
    pub fn interrupt(&self) {
        self.inner.post(LoopEvent::Interrupt);
    }

    /// Stop the loop with `code` without waiting for the task.
    pub fn request_exit(&self, code: i32) {
        self.inner.post(LoopEvent::Exit(code));
    }

    /// Post the same event a SIGWINCH posts.
    pub fn window_changed(&self) {
        self.inner.post(LoopEvent::WindowChanged);
    }

    /// Receiver that is marked changed after every window-size change.
    pub fn window_changes(&self) -> watch::Receiver<u64> {
        self.inner.window.subscribe()
    }

    pub fn state(&self) -> RunState {
        self.inner.state()
    }
}

impl std::fmt::Debug for RunLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoopHandle")
            .field("state", &self.state())
            .field("cleanups", &self.inner.cleanups)
            .finish()
    }
}

fn exit_code(joined: Result<anyhow::Result<i32>, JoinError>) -> i32 {
    match joined {
        Ok(Ok(code)) => code,
        // Already reported to the user where it was raised.
        Ok(Err(err)) if is_invalid_user(&err) => {
            debug!("task stopped: invalid user");
            1
        }
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "task failed");
            console::elog(&[Message::red(format!("Error: {err:#}"))]);
            1
        }
        Err(err) => {
            error!(error = %err, "task did not complete");
            console::elog(&[Message::red(format!("Error: {err}"))]);
            1
        }
    }
}

fn is_invalid_user(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<AccessError>()
            || matches!(
                cause.downcast_ref::<PreferencesError>(),
                Some(PreferencesError::Access(_))
            )
    })
}

/// Flush stdout and exit without running destructors.
fn exit_now(code: i32) -> ! {
    if let Err(err) = io::stdout().flush() {
        debug!(error = %err, "flushing stdout before exit failed");
    }
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn quiet_config() -> RunLoopConfig {
        RunLoopConfig {
            tick: Duration::from_millis(20),
            cleanup_timeout: Duration::from_secs(5),
            handle_signals: false,
        }
    }

    fn record(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> impl FnOnce() -> CleanupFuture + Send + 'static {
        let log = log.clone();
        move || -> CleanupFuture {
            Box::pin(async move {
                log.lock().unwrap().push(id);
                anyhow::Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_completion_runs_cleanups_in_order() {
        let run_loop = RunLoop::new(quiet_config());
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(run_loop.defer_task(record(&log, 1)));
        assert!(run_loop.defer_task(record(&log, 2)));
        let observer = run_loop.handle();
        assert_eq!(observer.state(), RunState::Idle);

        let task_log = log.clone();
        let termination = run_loop
            .drive(move |handle| async move {
                assert_eq!(handle.state(), RunState::Running);
                assert!(handle.defer_task(record(&task_log, 3)));
                Ok(3)
            })
            .await;

        assert_eq!(
            termination,
            Termination {
                code: 3,
                reason: ExitReason::Completed
            }
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(observer.state(), RunState::Exited);
        assert!(!observer.defer_task(record(&log, 4)));
    }

    #[tokio::test]
    async fn test_task_error_exits_with_one_after_cleanup() {
        let run_loop = RunLoop::new(quiet_config());
        let log = Arc::new(Mutex::new(Vec::new()));
        run_loop.defer_task(record(&log, 1));

        let termination = run_loop
            .drive(|_| async { Err(anyhow::anyhow!("no such file")) })
            .await;

        assert_eq!(termination.code, 1);
        assert_eq!(termination.reason, ExitReason::Completed);
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_invalid_user_exits_with_one() {
        let termination = RunLoop::new(quiet_config())
            .drive(|_| async {
                Err::<i32, _>(AccessError::InvalidUser).context("checking user")
            })
            .await;
        assert_eq!(termination.code, 1);
    }

    #[tokio::test]
    async fn test_task_panic_exits_with_one() {
        let termination = RunLoop::new(quiet_config())
            .drive(|_| async {
                if true {
                    panic!("task blew up");
                }
                Ok(0)
            })
            .await;
        assert_eq!(termination.code, 1);
    }

    #[tokio::test]
    async fn test_interrupt_runs_cleanups_once_and_exits_zero() {
        let run_loop = RunLoop::new(quiet_config());
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 1..=3 {
            run_loop.defer_task(record(&log, id));
        }

        let termination = run_loop
            .drive(|handle| async move {
                handle.interrupt();
                std::future::pending::<()>().await;
                Ok(9)
            })
            .await;

        assert_eq!(
            termination,
            Termination {
                code: 0,
                reason: ExitReason::Interrupted
            }
        );
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_racing_completion_cleans_up_once() {
        for _ in 0..20 {
            let run_loop = RunLoop::new(quiet_config());
            let log = Arc::new(Mutex::new(Vec::new()));
            run_loop.defer_task(record(&log, 1));
            run_loop.defer_task(record(&log, 2));

            let termination = run_loop
                .drive(|handle| async move {
                    handle.interrupt();
                    Ok(5)
                })
                .await;

            match termination.reason {
                ExitReason::Completed => assert_eq!(termination.code, 5),
                ExitReason::Interrupted => assert_eq!(termination.code, 0),
                ExitReason::Requested => panic!("unexpected exit request"),
            }
            assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        }
    }

    #[tokio::test]
    async fn test_request_exit_stops_without_task() {
        let termination = RunLoop::new(quiet_config())
            .drive(|handle| async move {
                handle.request_exit(4);
                std::future::pending::<()>().await;
                Ok(0)
            })
            .await;
        assert_eq!(
            termination,
            Termination {
                code: 4,
                reason: ExitReason::Requested
            }
        );
    }

    #[tokio::test]
    async fn test_window_change_is_broadcast() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let termination = RunLoop::new(quiet_config())
            .drive(|handle| async move {
                let mut changes = handle.window_changes();
                handle.window_changed();
                tokio::time::timeout(Duration::from_secs(5), changes.changed())
                    .await
                    .context("no window change seen")??;
                let generation = *changes.borrow();
                if seen_tx.send(generation).is_err() {
                    anyhow::bail!("generation receiver dropped");
                }
                Ok(0)
            })
            .await;
        assert_eq!(termination.code, 0);
        assert_eq!(seen_rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sigwinch_reaches_subscribers() {
        let config = RunLoopConfig {
            handle_signals: true,
            ..quiet_config()
        };
        let termination = RunLoop::new(config)
            .drive(|handle| async move {
                let mut changes = handle.window_changes();
                nix::sys::signal::raise(nix::sys::signal::Signal::SIGWINCH)?;
                tokio::time::timeout(Duration::from_secs(5), changes.changed())
                    .await
                    .context("no window change seen")??;
                Ok(0)
            })
            .await;
        assert_eq!(termination.code, 0);
    }

    #[tokio::test]
    async fn test_failing_cleanup_does_not_block_exit() {
        let run_loop = RunLoop::new(quiet_config());
        let log = Arc::new(Mutex::new(Vec::new()));
        run_loop.defer_task(|| async { anyhow::bail!("could not remove temp dir") });
        run_loop.defer_task(record(&log, 2));

        let termination = run_loop.drive(|_| async { Ok(0) }).await;
        assert_eq!(termination.code, 0);
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_invalid_user_detection_sees_through_wrappers() {
        let direct = anyhow::Error::new(AccessError::InvalidUser);
        assert!(is_invalid_user(&direct));

        let wrapped = anyhow::Error::new(PreferencesError::from(AccessError::InvalidUser))
            .context("opening preferences");
        assert!(is_invalid_user(&wrapped));

        assert!(!is_invalid_user(&anyhow::anyhow!("other failure")));
    }
}
