use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

/// Per-key async locks serializing reconciles of one object.
///
/// Entries nobody holds or waits on are pruned whenever a key is acquired.
#[derive(Debug, Default)]
pub struct KeyedLock {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                // a poisoned map is still consistent
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|k, l| k.eq(key) || Arc::strong_count(l) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::KeyedLock;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLock::new());
        let guard = locks.acquire("b1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("b1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter acquired the lock")
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLock::new();
        let _b1 = locks.acquire("b1").await;
        let b2 = tokio::time::timeout(Duration::from_secs(1), locks.acquire("b2")).await;
        assert!(b2.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = KeyedLock::new();
        drop(locks.acquire("b1").await);
        drop(locks.acquire("b2").await);
        let _b3 = locks.acquire("b3").await;
        assert_eq!(1, locks.len());
    }
}
