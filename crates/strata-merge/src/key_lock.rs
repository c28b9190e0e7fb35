//! Per-natural-key write serialization.
//!
//! Within one run every key is processed by exactly one task. The lock table
//! extends that guarantee across runs sharing an engine, so two concurrent
//! runs never interleave a close/open pair on the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type KeyMutex = Arc<tokio::sync::Mutex<()>>;

/// Table of async mutexes keyed by `(source, natural_key)`.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<(String, String), KeyMutex>>,
}

impl KeyLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to a key.
    pub async fn lock(&self, source: &str, natural_key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry((source.to_string(), natural_key.to_string()))
                .or_default()
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
