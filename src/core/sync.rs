//! Synchronization helpers for poisoned locks
//!
//! The engine's shared state (health state, in-flight keys, broker tables) is
//! plain data that stays consistent even if a holder panicked, and the
//! consumer loops must keep running, so poisoned guards are recovered instead
//! of propagated.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked
///
/// `what` names the protected state in the warning that is logged on recovery.
pub fn lock_recovering<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poison: PoisonError<MutexGuard<'a, T>>| {
        log::warn!(
            "Recovered poisoned lock guarding {} (a panic occurred while it was held)",
            what
        );
        poison.into_inner()
    })
}
