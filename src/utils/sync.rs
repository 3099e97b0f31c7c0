//! Lock helpers shared by the reader thread, signal-driven callbacks and
//! the async side.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the data if a previous holder panicked.
///
/// Every value guarded this way stays consistent across a panic (slots and
/// lists are swapped whole), so poisoning carries no information here.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
