//! In-memory key store for development and testing.
//!
//! Production deployments hand the core a persistent implementation of
//! [`SignalKeyStore`]; the semantics here are the reference.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

use super::traits::{KeyMap, KeyMutations, KeyType, SignalKeyStore, StoreError, StoreResult};

/// In-memory implementation of the blob store.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: RwLock<HashMap<(KeyType, String), Bytes>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, for assertions in tests.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SignalKeyStore for MemoryKeyStore {
    async fn get(&self, typ: KeyType, ids: &[String]) -> StoreResult<KeyMap> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        let mut out = KeyMap::new();
        for id in ids {
            if let Some(value) = entries.get(&(typ, id.clone())) {
                out.insert(id.clone(), value.clone());
            }
        }
        Ok(out)
    }

    async fn set(&self, data: &KeyMutations) -> StoreResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        for (typ, ids) in data {
            for (id, value) in ids {
                match value {
                    Some(v) => {
                        entries.insert((*typ, id.clone()), v.clone());
                    }
                    None => {
                        entries.remove(&(*typ, id.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::single_mutation;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryKeyStore::new();
        store
            .set(&single_mutation(KeyType::Session, "addr.0", Some(Bytes::from_static(b"s1"))))
            .await
            .unwrap();

        let got = store.get(KeyType::Session, &["addr.0".to_string()]).await.unwrap();
        assert_eq!(got.get("addr.0").unwrap().as_ref(), b"s1");
    }

    #[tokio::test]
    async fn test_missing_ids_are_omitted() {
        let store = MemoryKeyStore::new();
        let got = store
            .get(KeyType::PreKey, &["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_none_deletes() {
        let store = MemoryKeyStore::new();
        store
            .set(&single_mutation(KeyType::PreKey, "7", Some(Bytes::from_static(b"k"))))
            .await
            .unwrap();
        store
            .set(&single_mutation(KeyType::PreKey, "7", None))
            .await
            .unwrap();
        assert!(store.is_empty());
    }
}
