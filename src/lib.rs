//! scriptrun - run shell commands under a supervising run loop
//!
//! This library provides the pieces the `scriptrun` binary is built from:
//! - Shell processes with merged, streamed output and exactly-once completion
//! - A run loop that drives one async task, handles SIGINT and SIGWINCH,
//!   and runs deferred cleanups exactly once before exiting
//! - Console messages and prompts, a small preferences store, configuration
//!
//! # Example
//!
//! ```no_run
//! use scriptrun::runloop::{RunLoop, RunLoopConfig};
//! use scriptrun::shell;
//!
//! fn main() {
//!     let run_loop = RunLoop::new(RunLoopConfig::default());
//!     run_loop.defer_task(|| async {
//!         println!("cleaning up");
//!         Ok(())
//!     });
//!
//!     run_loop.run(|_handle| async {
//!         let result = shell::run("echo hello", true, true).await?;
//!         Ok(result.status.code().unwrap_or(1))
//!     })
//! }
//! ```

pub mod config;
pub mod console;
pub mod preferences;
pub mod runloop;
pub mod shell;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, LogConfig};
pub use console::Message;
pub use preferences::{AccessError, Preferences, PreferencesError};
pub use runloop::{ExitReason, RunLoop, RunLoopConfig, RunLoopHandle, RunState, Termination};
pub use shell::{ChildRegistry, CommandOutput, RunOptions, ShellConfig, ShellProcess, SpawnError};
