use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
///
/// Scheduler state stays consistent across a poisoned lock: every mutation
/// under these locks is a plain field update that cannot be left half done.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
