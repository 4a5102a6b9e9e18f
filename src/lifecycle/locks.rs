//! Per-name mutual exclusion for container operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A map of container name to async mutex.
///
/// Holding a [`NameGuard`] makes "check existence, then create" atomic with
/// respect to every other caller using the same name. Entries are pruned
/// once nobody holds or waits on them, including waiters that gave up.
#[derive(Debug, Default)]
pub struct NameLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the section for `name` is free and takes it.
    ///
    /// Dropping the returned future before it completes withdraws the claim.
    pub async fn acquire(&self, name: &str) -> NameGuard<'_> {
        let mutex = {
            let mut slots = self.slots();
            let slot = slots.entry(name.to_string()).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };

        // Built before waiting so its drop releases the claim on cancel too.
        let mut guard = NameGuard {
            locks: self,
            name: name.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    /// Number of names currently tracked.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive section for one container name, released on drop.
#[derive(Debug)]
pub struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NameGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots();
        if let Some(slot) = slots.get_mut(&self.name) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_released_and_pruned() {
        let locks = NameLocks::new();
        {
            let guard = locks.acquire("repocate-app").await;
            assert_eq!(guard.name(), "repocate-app");
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_name_is_serialized() {
        let locks = Arc::new(NameLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("repocate-app").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task should finish");
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_names_are_independent() {
        let locks = NameLocks::new();
        let first = locks.acquire("repocate-a").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire("repocate-b"))
            .await
            .expect("different name must not block");

        assert_eq!(locks.len(), 2);
        drop(first);
        drop(second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_slot_alive() {
        let locks = Arc::new(NameLocks::new());
        let first = locks.acquire("repocate-app").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("repocate-app").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        waiter.await.expect("waiter should acquire after release");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_pruned() {
        let locks = NameLocks::new();
        let holder = locks.acquire("repocate-app").await;

        let gave_up =
            tokio::time::timeout(Duration::from_millis(10), locks.acquire("repocate-app")).await;
        assert!(gave_up.is_err());
        assert_eq!(locks.len(), 1);

        drop(holder);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_dropped_after_holder_release_is_pruned() {
        let locks = NameLocks::new();
        let holder = locks.acquire("repocate-app").await;

        let mut waiter = Box::pin(locks.acquire("repocate-app"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(holder);
        assert_eq!(locks.len(), 1);
        drop(waiter);
        assert!(locks.is_empty());

        // The name is usable again afterwards.
        let again = locks.acquire("repocate-app").await;
        assert_eq!(locks.len(), 1);
        drop(again);
        assert!(locks.is_empty());
    }
}
