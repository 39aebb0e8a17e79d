//! # Utility Modules
//!
//! Supporting utilities for logging, timing, and lock hygiene.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Time**: Monotonic timestamps for ping round-trips
//!
//! The lock helpers recover from poisoned locks instead of panicking; the
//! guarded state is plain data and stays usable after a holder panicked.

pub mod logging;
pub mod time;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
