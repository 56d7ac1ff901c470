use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key, created on first use.
///
/// Requests for the same key queue up behind each other; different keys never
/// contend beyond the brief map lookup.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Released when the guard drops.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(&"SP-01").await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"SP-01")).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"SP-02")).await;
        assert!(other.is_ok());

        drop(guard);
        let again = tokio::time::timeout(Duration::from_millis(20), locks.lock(&"SP-01")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&1u32).await;
        drop(locks.lock(&2u32).await);

        assert_eq!(locks.prune().await, 1);
        assert_eq!(locks.len().await, 1);
        drop(held);
        assert_eq!(locks.prune().await, 1);
    }
}
