//! Single-flight execution of keyed background work
//!
//! `launch_if_absent` starts work for a key only when no work for that key is
//! already running. The key is released when the work finishes, fails or
//! panics, after which the same key can be launched again.

use crate::core::sync::lock_recovering;
use crate::flight::keyed::KeyedMutex;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Removes a key from the in-flight set when dropped
struct InFlightRelease<K: Eq + Hash> {
    in_flight: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for InFlightRelease<K> {
    fn drop(&mut self) {
        lock_recovering(&self.in_flight, "in-flight keys").remove(&self.key);
    }
}

pub struct SingleFlight<K> {
    in_flight: Arc<Mutex<HashSet<K>>>,
    locks: KeyedMutex<K>,
}

impl<K> Clone for SingleFlight<K> {
    fn clone(&self) -> Self {
        Self {
            in_flight: self.in_flight.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            locks: KeyedMutex::default(),
        }
    }
}

impl<K> SingleFlight<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` unless work for `key` is already in flight
    ///
    /// Returns `None` without polling `work` when the key is taken. Failures
    /// are logged; the returned handle only reports completion.
    pub fn launch_if_absent<F, E>(&self, key: K, work: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if !lock_recovering(&self.in_flight, "in-flight keys").insert(key.clone()) {
            log::debug!("Work for '{}' already in flight; not launching", key);
            return None;
        }

        let release = InFlightRelease {
            in_flight: self.in_flight.clone(),
            key: key.clone(),
        };
        let locks = self.locks.clone();
        Some(tokio::spawn(async move {
            let _release = release;
            let _guard = locks.lock(key.clone()).await;
            log::trace!("Running single-flight work for '{}'", key);
            if let Err(e) = work.await {
                log::error!("Single-flight work for '{}' failed: {}", key, e);
            }
        }))
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock_recovering(&self.in_flight, "in-flight keys").contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock_recovering(&self.in_flight, "in-flight keys").len()
    }

    /// Exclusive access to `key` for work that does not go through `launch_if_absent`
    pub async fn lock(&self, key: K) -> crate::flight::keyed::KeyedGuard<K> {
        self.locks.lock(key).await
    }
}
