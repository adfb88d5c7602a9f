//! Per-key async locks.
//!
//! Every mirror/unmirror holds the lock of the key it addresses for its whole
//! duration, so two operations on the same key run one after the other while
//! operations on different keys interleave freely.

use dmirror_replicate::Key;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = Arc<Mutex<HashMap<Key, Arc<AsyncMutex<()>>>>>;

fn table(locks: &Table) -> MutexGuard<'_, HashMap<Key, Arc<AsyncMutex<()>>>> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: Table,
}

impl KeyLocks {
    pub async fn lock(&self, key: Key) -> KeyGuard {
        let mutex = table(&self.locks).entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard { key, locks: self.locks.clone(), guard: Some(guard) }
    }

    /// Lock several keys, always in key order so that two callers locking
    /// overlapping sets cannot deadlock.
    pub async fn lock_all(&self, keys: impl IntoIterator<Item = Key>) -> Vec<KeyGuard> {
        let mut keys: Vec<Key> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        table(&self.locks).len()
    }
}

/// Releases the key's lock on drop, and forgets the key once nobody else is
/// holding or waiting for it.
pub(crate) struct KeyGuard {
    key: Key,
    locks: Table,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = table(&self.locks);
        if locks.get(&self.key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(byte: u8) -> Key {
        Key::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::default());
        let active = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (locks, active) = (locks.clone(), active.clone());
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(key(1)).await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLocks::default();
        let _a = locks.lock(key(1)).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(key(2))).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_all_dedups() {
        let locks = KeyLocks::default();
        let guards = locks.lock_all([key(2), key(1), key(2)]).await;
        assert_eq!(guards.len(), 2);
        drop(guards);
        assert_eq!(locks.len(), 0);
    }
}
