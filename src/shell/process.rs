//! Shell process lifecycle: spawn, reap, completion, teardown.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use nix::libc;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::pipe::PipeChannel;
use super::reader;
use super::winsize::{TtyWindowSize, WindowSizeForwarder};
use super::SpawnError;
use crate::utils::sync::lock;

/// Receives decoded output text. Runs on the reader thread.
pub type OutputSink = Box<dyn FnMut(&str) + Send + 'static>;

/// Receives the child's wait status once the output stream has ended.
pub type Completion = Box<dyn FnOnce(ExitStatus) + Send + 'static>;

/// How shell processes are launched.
#[derive(Clone, Debug)]
pub struct ShellConfig {
    /// Interpreter invoked as `<interpreter> -c <command>`.
    pub interpreter: PathBuf,
    /// Bytes requested per read from the output pipe.
    pub read_buffer: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("/bin/sh"),
            read_buffer: 8 * 1024,
        }
    }
}

/// Status reported when the child could not be waited on.
pub(crate) fn failed_wait_status() -> ExitStatus {
    ExitStatus::from_raw(255 << 8)
}

enum ReapState {
    Running(Child),
    /// A thread is waiting for this child to exit. The pid stays allocated
    /// until that thread reaps it under the lock.
    Waiting,
    Reaped(ExitStatus),
}

enum CompletionSlot {
    Waiting(Option<Completion>),
    /// Stream ended before a callback was installed.
    Finished(ExitStatus),
    Fired,
}

/// State shared between the owning handle, the reader thread and
/// window-change followers.
pub(crate) struct Shared {
    command: String,
    pid: u32,
    reap: Mutex<ReapState>,
    reaped: Condvar,
    completion: Mutex<CompletionSlot>,
    cancelled: AtomicBool,
    window: WindowSizeForwarder<TtyWindowSize>,
}

impl Shared {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn command(&self) -> &str {
        &self.command
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Block until the child has exited and been reaped. Only one thread
    /// ever waits on the child; the others park on the condvar and all of
    /// them see the same status.
    ///
    /// The exit is awaited without the lock but collected with it held, so
    /// `signal` never races with the pid being released.
    pub(crate) fn wait(&self) -> io::Result<ExitStatus> {
        let mut state = lock(&self.reap);
        loop {
            match std::mem::replace(&mut *state, ReapState::Waiting) {
                ReapState::Reaped(status) => {
                    *state = ReapState::Reaped(status);
                    return Ok(status);
                }
                ReapState::Waiting => {
                    state = self.reaped.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                ReapState::Running(mut child) => {
                    drop(state);
                    if let Err(err) = wait_for_exit(self.pid) {
                        debug!(pid = self.pid, error = %err, "waiting for exit without reaping failed");
                    }
                    state = lock(&self.reap);
                    // The child is a zombie now, so this returns immediately.
                    let result = child.wait();
                    *state = match &result {
                        Ok(status) => {
                            debug!(pid = self.pid, %status, "reaped shell process");
                            ReapState::Reaped(*status)
                        }
                        Err(_) => ReapState::Running(child),
                    };
                    self.reaped.notify_all();
                    return result;
                }
            }
        }
    }

    /// Signal the child unless it has already been reaped, so a recycled
    /// pid is never targeted.
    pub(crate) fn signal(&self, signal: Signal) -> io::Result<()> {
        let state = lock(&self.reap);
        if let ReapState::Reaped(_) = *state {
            debug!(pid = self.pid, ?signal, "child already reaped; not signalling");
            return Ok(());
        }
        kill(Pid::from_raw(self.pid as i32), signal).map_err(io::Error::from)
    }

    fn set_completion(&self, completion: Completion) {
        let mut slot = lock(&self.completion);
        match std::mem::replace(&mut *slot, CompletionSlot::Fired) {
            CompletionSlot::Waiting(_) => *slot = CompletionSlot::Waiting(Some(completion)),
            CompletionSlot::Finished(status) => {
                drop(slot);
                completion(status);
            }
            CompletionSlot::Fired => {
                debug!(pid = self.pid, "completion already delivered; ignoring new callback");
            }
        }
    }

    /// Deliver `status` to the installed callback, or park it for a callback
    /// installed later. The callback is consumed either way.
    pub(crate) fn finish(&self, status: ExitStatus) {
        let mut slot = lock(&self.completion);
        match std::mem::replace(&mut *slot, CompletionSlot::Fired) {
            CompletionSlot::Waiting(Some(completion)) => {
                drop(slot);
                completion(status);
            }
            CompletionSlot::Waiting(None) => *slot = CompletionSlot::Finished(status),
            done => *slot = done,
        }
    }
}

/// Block until `pid` has exited, leaving it unreaped.
fn wait_for_exit(pid: u32) -> io::Result<()> {
    let id = pid as libc::id_t;
    loop {
        // SAFETY: an all-zero `siginfo_t` is valid, and waitid only writes
        // through the pointer to this live local.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(libc::P_PID, id, &raw mut info, libc::WEXITED | libc::WNOWAIT)
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A child running `<interpreter> -c <command>` whose stdout and stderr are
/// merged into one captured stream.
///
/// Capture starts as soon as `spawn` returns. Dropping the handle never
/// blocks: it stops output delivery and leaves the reader thread to drain
/// the pipe and reap the child once it exits. The completion never fires
/// after a drop.
pub struct ShellProcess {
    shared: Arc<Shared>,
}

impl ShellProcess {
    pub fn spawn<F>(command: impl Into<String>, sink: F) -> Result<Self, SpawnError>
    where
        F: FnMut(&str) + Send + 'static,
    {
        Self::spawn_with(&ShellConfig::default(), command, sink)
    }

    pub fn spawn_with<F>(
        config: &ShellConfig,
        command: impl Into<String>,
        sink: F,
    ) -> Result<Self, SpawnError>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(SpawnError::EmptyCommand);
        }

        let mut pipe = PipeChannel::open().map_err(SpawnError::CouldNotOpenPipe)?;
        let (Some(read_end), Some(stdout_end)) = (pipe.take_read(), pipe.take_write()) else {
            return Err(SpawnError::CouldNotOpenPipe(io::Error::other(
                "pipe ends already taken",
            )));
        };
        let stderr_end = stdout_end
            .try_clone()
            .map_err(SpawnError::CouldNotOpenPipe)?;
        let read_end = Arc::new(read_end);

        let mut cmd = Command::new(&config.interpreter);
        cmd.arg("-c")
            .arg(&command)
            .stdout(Stdio::from(stdout_end))
            .stderr(Stdio::from(stderr_end));
        let spawned = cmd.spawn();
        // The parent's copies of the write end live in `cmd`. Closing them
        // leaves the child as the only writer, so its exit ends the stream.
        drop(cmd);

        let child = spawned.map_err(|source| SpawnError::CouldNotSpawn {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(pid, command = %command, "spawned shell process");

        let shared = Arc::new(Shared {
            command,
            pid,
            reap: Mutex::new(ReapState::Running(child)),
            reaped: Condvar::new(),
            completion: Mutex::new(CompletionSlot::Waiting(None)),
            cancelled: AtomicBool::new(false),
            window: WindowSizeForwarder::new(TtyWindowSize::new(read_end.clone())),
        });

        if let Err(source) =
            reader::spawn_reader(shared.clone(), read_end, Box::new(sink), config.read_buffer)
        {
            // Without a reader nobody drains the pipe or reaps the child.
            shared.cancel();
            if let Err(err) = shared.signal(Signal::SIGKILL) {
                warn!(pid, error = %err, "failed to kill child after reader spawn failure");
            }
            if let Err(err) = shared.wait() {
                warn!(pid, error = %err, "failed to reap child after reader spawn failure");
            }
            return Err(SpawnError::CouldNotSpawn {
                command: shared.command.clone(),
                source,
            });
        }

        let process = Self { shared };
        process.refresh_window_size();
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn command(&self) -> &str {
        &self.shared.command
    }

    /// Install the completion callback.
    ///
    /// Fires exactly once, after the last sink call and after the child has
    /// been reaped. If that already happened, it fires immediately on the
    /// calling thread.
    pub fn set_completion<F>(&self, completion: F)
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        self.shared.set_completion(Box::new(completion));
    }

    /// Block until the child exits and return its wait status. Returns the
    /// cached status immediately once the child has been reaped.
    pub fn wait(&self) -> io::Result<ExitStatus> {
        self.shared.wait()
    }

    /// Re-read the terminal size and propagate it if it changed.
    pub fn refresh_window_size(&self) -> bool {
        self.shared.window.refresh()
    }

    /// Refresh the window size on every notification from `changes` until
    /// this process is dropped or the sender goes away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn follow_window_changes(
        &self,
        mut changes: watch::Receiver<u64>,
    ) -> tokio::task::JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.is_cancelled() {
                    break;
                }
                shared.window.refresh();
            }
        })
    }

    /// Send `signal` to the child if it has not been reaped yet.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        self.shared.signal(signal)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        debug!(pid = self.shared.pid, "shell process handle dropped");
        self.shared.cancel();
    }
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcess")
            .field("pid", &self.shared.pid)
            .field("command", &self.shared.command)
            .finish()
    }
}
