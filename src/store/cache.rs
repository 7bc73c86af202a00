//! Read-through cache over the external key store.
//!
//! Hits come from memory; misses are fetched from the backing store in one
//! batched call and populated. Values are reference-counted [`Bytes`], so
//! cache hits never copy. Misses are never negatively cached.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::traits::{KeyMap, KeyMutations, KeyType, SignalKeyStore, StoreResult};

/// Default entry lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    value: Bytes,
    fetched: Instant,
}

/// Caching adapter over a [`SignalKeyStore`].
pub struct CachedKeyStore {
    inner: Arc<dyn SignalKeyStore>,
    ttl: Duration,
    cache: Mutex<HashMap<(KeyType, String), CacheEntry>>,
}

impl CachedKeyStore {
    pub fn new(inner: Arc<dyn SignalKeyStore>) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn SignalKeyStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached_hits(&self, typ: KeyType, ids: &[String]) -> (KeyMap, Vec<String>) {
        let cache = self.cache.lock().expect("cache lock");
        let mut hits = KeyMap::new();
        let mut misses = Vec::new();
        for id in ids {
            match cache.get(&(typ, id.clone())) {
                Some(entry) if entry.fetched.elapsed() < self.ttl => {
                    hits.insert(id.clone(), entry.value.clone());
                }
                _ => misses.push(id.clone()),
            }
        }
        (hits, misses)
    }

    fn populate(&self, typ: KeyType, fetched: &KeyMap) {
        let mut cache = self.cache.lock().expect("cache lock");
        let now = Instant::now();
        for (id, value) in fetched {
            cache.insert(
                (typ, id.clone()),
                CacheEntry {
                    value: value.clone(),
                    fetched: now,
                },
            );
        }
    }

    fn apply_mutations(&self, data: &KeyMutations) {
        let mut cache = self.cache.lock().expect("cache lock");
        let now = Instant::now();
        for (typ, ids) in data {
            for (id, value) in ids {
                match value {
                    Some(v) => {
                        cache.insert(
                            (*typ, id.clone()),
                            CacheEntry {
                                value: v.clone(),
                                fetched: now,
                            },
                        );
                    }
                    None => {
                        cache.remove(&(*typ, id.clone()));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SignalKeyStore for CachedKeyStore {
    async fn get(&self, typ: KeyType, ids: &[String]) -> StoreResult<KeyMap> {
        let (mut hits, misses) = self.cached_hits(typ, ids);

        if !misses.is_empty() {
            let fetched = self.inner.get(typ, &misses).await?;
            self.populate(typ, &fetched);
            hits.extend(fetched);
        }

        Ok(hits)
    }

    async fn set(&self, data: &KeyMutations) -> StoreResult<()> {
        self.inner.set(data).await?;
        self.apply_mutations(data);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.cache.lock().expect("cache lock").clear();
        self.inner.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryKeyStore;
    use crate::store::traits::single_mutation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a store and counts backend reads.
    struct CountingStore {
        inner: MemoryKeyStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SignalKeyStore for CountingStore {
        async fn get(&self, typ: KeyType, ids: &[String]) -> StoreResult<KeyMap> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(typ, ids).await
        }
        async fn set(&self, data: &KeyMutations) -> StoreResult<()> {
            self.inner.set(data).await
        }
        async fn clear(&self) -> StoreResult<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_second_read_is_a_hit() {
        let counting = Arc::new(CountingStore {
            inner: MemoryKeyStore::new(),
            reads: AtomicUsize::new(0),
        });
        counting
            .set(&single_mutation(KeyType::Session, "a.0", Some(Bytes::from_static(b"v"))))
            .await
            .unwrap();

        let cached = CachedKeyStore::new(counting.clone());
        let ids = vec!["a.0".to_string()];
        cached.get(KeyType::Session, &ids).await.unwrap();
        cached.get(KeyType::Session, &ids).await.unwrap();
        assert_eq!(counting.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_misses_are_not_negatively_cached() {
        let counting = Arc::new(CountingStore {
            inner: MemoryKeyStore::new(),
            reads: AtomicUsize::new(0),
        });
        let cached = CachedKeyStore::new(counting.clone());

        let ids = vec!["ghost".to_string()];
        assert!(cached.get(KeyType::PreKey, &ids).await.unwrap().is_empty());
        assert!(cached.get(KeyType::PreKey, &ids).await.unwrap().is_empty());
        // both reads went to the backend
        assert_eq!(counting.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_write_through_updates_cache() {
        let backing = Arc::new(MemoryKeyStore::new());
        let cached = CachedKeyStore::new(backing.clone());

        cached
            .set(&single_mutation(KeyType::Session, "b.0", Some(Bytes::from_static(b"one"))))
            .await
            .unwrap();
        // backend sees the write immediately
        let raw = backing.get(KeyType::Session, &["b.0".to_string()]).await.unwrap();
        assert_eq!(raw.get("b.0").unwrap().as_ref(), b"one");

        // and the cached layer serves it back
        let got = cached.get(KeyType::Session, &["b.0".to_string()]).await.unwrap();
        assert_eq!(got.get("b.0").unwrap().as_ref(), b"one");
    }

    #[tokio::test]
    async fn test_expired_entries_refetch() {
        let counting = Arc::new(CountingStore {
            inner: MemoryKeyStore::new(),
            reads: AtomicUsize::new(0),
        });
        counting
            .set(&single_mutation(KeyType::Session, "c.0", Some(Bytes::from_static(b"v"))))
            .await
            .unwrap();

        let cached = CachedKeyStore::with_ttl(counting.clone(), Duration::from_millis(0));
        let ids = vec!["c.0".to_string()];
        cached.get(KeyType::Session, &ids).await.unwrap();
        cached.get(KeyType::Session, &ids).await.unwrap();
        assert_eq!(counting.reads.load(Ordering::SeqCst), 2);
    }
}
