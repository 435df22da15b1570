use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Async mutual exclusion per string key. Entries are dropped from the map
/// once nobody holds or waits on them.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    inner: Arc<LockMap>,
}

pub struct KeyedGuard {
    key: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self.inner.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            locks: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Locks every key, in sorted order, so overlapping key sets taken by
    /// concurrent callers can never wait on each other in a cycle.
    pub async fn lock_all(&self, keys: &[String]) -> Vec<KeyedGuard> {
        let mut ordered: Vec<&String> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.lock(key).await);
        }
        guards
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}
