use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

/// Keyed cache of expensive handles. At most one initializer runs per key at
/// a time; concurrent callers wait for it and share the value.
pub struct HandleCache<K, V> {
    slots: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for HandleCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> HandleCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Arc<OnceCell<V>>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cell(&self, key: &K) -> Arc<OnceCell<V>> {
        let mut slots = self.slots();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Initialize once and cache whatever `init` produces.
    pub async fn get_or_init<F, Fut>(&self, key: K, init: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self.cell(&key);
        cell.get_or_init(init).await.clone()
    }

    /// Initialize once; errors are returned and not cached.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(&key);
        cell.get_or_try_init(init).await.cloned()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.slots().get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of initialized handles.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every slot and return the handles that had been initialized.
    pub fn clear(&self) -> Vec<(K, V)> {
        let drained: Vec<(K, Arc<OnceCell<V>>)> = self.slots().drain().collect();
        drained
            .into_iter()
            .filter_map(|(key, cell)| cell.get().cloned().map(|value| (key, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_flight_initialization() {
        let cache: Arc<HandleCache<String, usize>> = Arc::new(HandleCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_init("eng".to_string(), || async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            calls.fetch_add(1, Ordering::SeqCst)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: HandleCache<&'static str, u32> = HandleCache::new();
        let first: Result<u32, String> = cache
            .get_or_try_init("k", || async { Err("nope".to_string()) })
            .await;
        assert!(first.is_err());
        assert!(cache.is_empty());

        let second: Result<u32, String> = cache.get_or_try_init("k", || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
        assert_eq!(cache.get(&"k"), Some(7));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let cache: HandleCache<u8, u8> = HandleCache::new();
        cache.get_or_init(1, || async { 10 }).await;

        let drained = cache.clear();
        assert_eq!(drained, vec![(1, 10)]);
        assert!(cache.clear().is_empty());
        assert_eq!(cache.get(&1), None);
    }
}
