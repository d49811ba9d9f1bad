//! Lock helper shared by modules that guard a synchronous section behind
//! `std::sync::Mutex` (reserved for state never held across an `.await`;
//! anything suspended across a yield point uses `tokio::sync` instead).

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a prior holder panicked instead
/// of propagating the poison. A panicking listener callback must not take
/// every other listener's access to the same bus down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
