/// Core Module for querydeck
///
/// This module contains the shared infrastructure the session engine is
/// built on: the database driver contract, the bundled SQLite driver,
/// statement helpers, and the error taxonomy.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{Result, SessionError};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires a mutex, recovering the data if a previous holder panicked.
///
/// Every component keeps its state consistent between statements, so a
/// poisoned lock carries no torn state worth refusing.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
