//! Storage for forced variations, keyed by (experiment, user).
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverrideKey {
    pub experiment_key: String,
    pub user_id: String,
}

impl OverrideKey {
    pub fn new(experiment_key: impl Into<String>, user_id: impl Into<String>) -> OverrideKey {
        OverrideKey {
            experiment_key: experiment_key.into(),
            user_id: user_id.into(),
        }
    }
}

/// A key-value store holding the single current forced variation per (experiment, user).
///
/// The store does not validate keys against configuration. Errors are reserved for the store
/// itself being unavailable.
#[async_trait]
pub trait ForcedVariationStore: Send + Sync {
    async fn get(&self, key: &OverrideKey) -> Result<Option<String>>;

    /// Store `variation_key`, returning the value it replaced. The read and the write are one
    /// atomic step.
    async fn set(&self, key: &OverrideKey, variation_key: &str) -> Result<Option<String>>;

    /// Delete the override, returning the removed value. The read and the delete are one atomic
    /// step.
    async fn remove(&self, key: &OverrideKey) -> Result<Option<String>>;
}

/// In-process store. Overrides live as long as the store.
#[derive(Debug, Default)]
pub struct InMemoryOverrideStore {
    overrides: RwLock<HashMap<OverrideKey, String>>,
}

impl InMemoryOverrideStore {
    pub fn new() -> InMemoryOverrideStore {
        InMemoryOverrideStore::default()
    }

    pub fn len(&self) -> usize {
        self.overrides.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Store("override map lock poisoned".to_owned())
}

#[async_trait]
impl ForcedVariationStore for InMemoryOverrideStore {
    async fn get(&self, key: &OverrideKey) -> Result<Option<String>> {
        Ok(self.overrides.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn set(&self, key: &OverrideKey, variation_key: &str) -> Result<Option<String>> {
        Ok(self
            .overrides
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), variation_key.to_owned()))
    }

    async fn remove(&self, key: &OverrideKey) -> Result<Option<String>> {
        Ok(self.overrides.write().map_err(poisoned)?.remove(key))
    }
}

/// A registry of async mutexes, one per key, used to serialize read-modify-write sequences on the
/// same key while leaving distinct keys uncontended. Entries are dropped once nobody holds or
/// waits for them.
pub struct KeyedLock<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        KeyedLock {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> KeyedLock<K> {
        KeyedLock::default()
    }

    pub async fn lock(&self, key: &K) -> KeyedLockGuard<'_, K> {
        let mutex = self
            .registry()
            .entry(key.clone())
            .or_insert_with(Default::default)
            .clone();

        let guard = mutex.lock_owned().await;

        KeyedLockGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn active_keys(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<K, Arc<tokio::sync::Mutex<()>>>> {
        // The registry is only touched for map bookkeeping, a panic cannot leave it inconsistent.
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct KeyedLockGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLock<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedLockGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.owner.registry();
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{ForcedVariationStore, InMemoryOverrideStore, KeyedLock, OverrideKey};

    #[tokio::test]
    async fn set_get_remove() {
        let store = InMemoryOverrideStore::new();
        let key = OverrideKey::new("exp", "user");

        assert_eq!(store.get(&key).await.unwrap(), None);

        assert_eq!(store.set(&key, "a").await.unwrap(), None);
        assert_eq!(store.get(&key).await.unwrap(), Some("a".to_owned()));

        assert_eq!(store.set(&key, "b").await.unwrap(), Some("a".to_owned()));
        assert_eq!(store.get(&key).await.unwrap(), Some("b".to_owned()));
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove(&key).await.unwrap(), Some("b".to_owned()));
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(store.is_empty());

        assert_eq!(store.remove(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = InMemoryOverrideStore::new();
        store.set(&OverrideKey::new("exp", "u1"), "a").await.unwrap();
        store.set(&OverrideKey::new("exp", "u2"), "b").await.unwrap();

        assert_eq!(
            store.get(&OverrideKey::new("exp", "u1")).await.unwrap(),
            Some("a".to_owned())
        );
        assert_eq!(
            store.get(&OverrideKey::new("other", "u1")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLock::<OverrideKey>::new());
        let key = OverrideKey::new("exp", "user");

        let guard = locks.lock(&key).await;

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let locks = KeyedLock::<OverrideKey>::new();

        let _a = locks.lock(&OverrideKey::new("exp", "u1")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&OverrideKey::new("exp", "u2")),
        )
        .await;

        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }
}
