//! Per-context async locks for drivers that are not atomic per id.
//!
//! An id only occupies the map while someone holds or waits on its lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one id; the map entry goes with the last holder.
#[derive(Debug)]
pub struct KeyedGuard {
    id: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map holds the only remaining reference unless someone waits.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &str) -> KeyedGuard {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyedGuard {
            id: id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Drop locks nobody holds or waits on, e.g. left by a cancelled wait.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialised() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.acquire("a").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_ids_leave_the_map() {
        let locks = KeyedLocks::new();
        let held = locks.acquire("a").await;
        drop(locks.acquire("b").await);
        assert_eq!(locks.len(), 1);

        for i in 0..100 {
            drop(locks.acquire(&format!("id{}", i)).await);
        }
        assert_eq!(locks.len(), 1);

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.acquire("a").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_prune_drops_abandoned_waits() {
        let locks = KeyedLocks::new();
        let held = locks.acquire("a").await;
        let mut pending = Box::pin(locks.acquire("a"));
        assert!(futures::poll!(&mut pending).is_pending());

        // Released while someone waits, then the wait is cancelled.
        drop(held);
        drop(pending);
        assert_eq!(locks.len(), 1);

        locks.prune();
        assert!(locks.is_empty());
    }
}
