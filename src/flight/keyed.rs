//! Per-key async mutex
//!
//! Locks for different keys never contend. A key's entry is pruned from the
//! map once the last guard or waiter for it is gone.

use crate::core::sync::lock_recovering;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type LockMap<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

pub struct KeyedMutex<K> {
    locks: LockMap<K>,
}

impl<K> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = lock_recovering(&self.locks, "keyed locks")
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: self.locks.clone(),
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn len(&self) -> usize {
        lock_recovering(&self.locks, "keyed locks").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds one key's lock; releasing it prunes the key when nobody else wants it
pub struct KeyedGuard<K: Eq + Hash> {
    locks: LockMap<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_recovering(&self.locks, "keyed locks");
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
