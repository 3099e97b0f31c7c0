//! Deferred cleanup actions, executed in registration order at most once.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::console::{self, Message};
use crate::utils::sync::lock;

pub type CleanupFuture = BoxFuture<'static, anyhow::Result<()>>;

type CleanupAction = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Outcome counts of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Ordered list of async cleanup actions guarded by a one-shot gate.
///
/// Whichever caller wins the gate in [`run_once`](Self::run_once) executes
/// every action; all other callers get `None`. Actions pushed after the gate
/// closed are rejected.
#[derive(Default)]
pub struct CleanupList {
    actions: Mutex<Vec<CleanupAction>>,
    started: AtomicBool,
}

impl CleanupList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action. Returns `false` if cleanup already started.
    pub fn push<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut actions = lock(&self.actions);
        if self.has_started() {
            warn!("cleanup already started; ignoring late deferred task");
            return false;
        }
        actions.push(Box::new(move || action().boxed()));
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.actions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.actions).is_empty()
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run every action in order, each bounded by `timeout`.
    ///
    /// A failing, panicking or timed-out action is reported and skipped; the
    /// remaining actions still run.
    pub async fn run_once(&self, timeout: Duration) -> Option<CleanupReport> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("cleanup already ran; skipping");
            return None;
        }

        let actions = std::mem::take(&mut *lock(&self.actions));
        debug!(count = actions.len(), "running deferred cleanup");

        let mut report = CleanupReport::default();
        for (index, action) in actions.into_iter().enumerate() {
            let guarded = AssertUnwindSafe(async move { action().await }).catch_unwind();
            match tokio::time::timeout(timeout, guarded).await {
                Ok(Ok(Ok(()))) => report.succeeded += 1,
                Ok(Ok(Err(err))) => {
                    report.failed += 1;
                    warn!(index, error = %format!("{err:#}"), "cleanup action failed");
                    console::elog(&[Message::red(format!("Cleanup failed: {err:#}"))]);
                }
                Ok(Err(_panic)) => {
                    report.failed += 1;
                    warn!(index, "cleanup action panicked");
                    console::elog(&[Message::red("Cleanup failed: action panicked")]);
                }
                Err(_elapsed) => {
                    report.timed_out += 1;
                    warn!(index, ?timeout, "cleanup action timed out");
                    console::elog(&[Message::red(format!(
                        "Cleanup timed out after {}ms",
                        timeout.as_millis()
                    ))]);
                }
            }
        }
        Some(report)
    }
}

impl std::fmt::Debug for CleanupList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupList")
            .field("pending", &self.len())
            .field("started", &self.has_started())
            .finish()
    }
}
