//! Shell process execution and supervision.
//!
//! A [`ShellProcess`] runs one command through `/bin/sh -c`, merges the
//! child's stdout and stderr into a single pipe, and drains that pipe on a
//! dedicated reader thread. Output is handed to a caller-supplied sink as
//! decoded text; once the stream ends the child is reaped and the completion
//! callback fires exactly once.
//!
//! [`run`] and [`run_with`] wrap those primitives into a single awaitable call
//! that collects the whole output.

mod pipe;
mod process;
mod reader;
mod run;
mod winsize;

use std::io;

use thiserror::Error;

pub use pipe::PipeChannel;
pub use process::{Completion, OutputSink, ShellConfig, ShellProcess};
pub use reader::Utf8Decoder;
pub use run::{ChildRegistry, CommandOutput, RunOptions, run, run_with};
pub use winsize::{TtyWindowSize, WindowSize, WindowSizeForwarder, WindowSizeIo};

/// Reasons a spawn attempt can fail. None of them leave a child behind.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("refusing to spawn an empty command")]
    EmptyCommand,

    #[error("could not open output pipe: {0}")]
    CouldNotOpenPipe(#[source] io::Error),

    #[error("could not spawn '{command}': {source}")]
    CouldNotSpawn {
        command: String,
        #[source]
        source: io::Error,
    },
}
