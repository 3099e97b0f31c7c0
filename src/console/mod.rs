//! User-facing console output and prompts.
//!
//! Diagnostics meant for developers go through `tracing`; everything the
//! person at the terminal is supposed to read (echoed commands, cleanup
//! notices, task errors, prompts) goes through here.

mod message;
mod prompt;

pub use message::{Message, Tint, elog, log, logf, render, write_messages};
pub use prompt::{InputError, Prompter};
