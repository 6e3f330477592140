//! Per-sandbox-id serialization.
//!
//! Two requests racing on the same sandbox id (e.g. a create overlapping a
//! destroy) must not interleave. This adapts the daemon's single semaphore
//! [`Locker`](crate::system::locker) pattern to a keyed map: one semaphore
//! per id, created on first use and reused for the lifetime of the process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Default)]
pub struct KeyedLocker {
    locks: DashMap<String, Arc<Semaphore>>,
}

pub struct KeyGuard {
    _permit: OwnedSemaphorePermit,
}

impl KeyedLocker {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires exclusive access to `key`, waiting if another operation on
    /// the same id is in flight. The returned guard releases on drop.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let semaphore = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        KeyGuard { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_operations_on_the_same_key() {
        let locker = Arc::new(KeyedLocker::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locker = locker.clone();
            let counter = counter.clone();
            let overlap = overlap.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locker.acquire("sbx-1").await;
                let in_flight = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if in_flight > 1 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locker = KeyedLocker::new();
        let guard_a = locker.acquire("sbx-a").await;
        let guard_b = tokio::time::timeout(Duration::from_millis(50), locker.acquire("sbx-b")).await;
        assert!(guard_b.is_ok());
        drop(guard_a);
    }
}
