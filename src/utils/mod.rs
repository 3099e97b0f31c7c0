//! Utility modules for common functionality.
//!
//! Logging configuration, a drop guard for scope-bound cleanup, and lock
//! helpers shared across threads.

pub mod guard;
pub mod logger;
pub mod sync;
