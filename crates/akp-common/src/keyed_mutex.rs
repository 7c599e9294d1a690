//! Process-wide keyed mutex registry
//!
//! Serializes read-modify-write sequences per target entity (an instance id)
//! within one process. Mutexes are created on first use and live until the
//! process exits; the key set is bounded by the number of managed entities.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

static GLOBAL: Lazy<Arc<KeyedMutex>> = Lazy::new(|| Arc::new(KeyedMutex::new()));

/// Registry of one async mutex per key
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock for one key; unlocks on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// The key this guard holds
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        trace!(key = %self.key, "Released keyed lock");
    }
}

impl KeyedMutex {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every controller in this process
    pub fn global() -> Arc<KeyedMutex> {
        GLOBAL.clone()
    }

    /// Acquire the mutex for `key`, creating it on first use
    pub async fn lock(&self, key: &str) -> KeyGuard {
        // Clone the Arc out so the map shard is not held while waiting
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        trace!(key = %key, "Acquired keyed lock");
        KeyGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no key has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
