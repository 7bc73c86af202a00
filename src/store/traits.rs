//! The opaque key-value contract between the core and external storage.
//!
//! Everything the signal layer persists is addressed by `(type, id)` and
//! stored as an opaque blob. External stores implement [`SignalKeyStore`];
//! the core stacks a read-through cache and a transactional layer on top.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;

/// Namespaces of the key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::PreKey => "pre-key",
            KeyType::Session => "session",
            KeyType::SenderKey => "sender-key",
            KeyType::SenderKeyMemory => "sender-key-memory",
            KeyType::AppStateSyncKey => "app-state-sync-key",
            KeyType::AppStateSyncVersion => "app-state-sync-version",
        }
    }

    pub const ALL: [KeyType; 6] = [
        KeyType::PreKey,
        KeyType::Session,
        KeyType::SenderKey,
        KeyType::SenderKeyMemory,
        KeyType::AppStateSyncKey,
        KeyType::AppStateSyncVersion,
    ];
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a batched read: id to value, absent ids omitted.
pub type KeyMap = HashMap<String, Bytes>;

/// A batched write: `None` deletes the entry.
pub type KeyMutations = HashMap<KeyType, HashMap<String, Option<Bytes>>>;

/// Error type for store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for crate::error::WireError {
    fn from(err: StoreError) -> Self {
        crate::error::WireError::StoreFailure(err.to_string())
    }
}

/// The externally provided blob store.
#[async_trait]
pub trait SignalKeyStore: Send + Sync {
    /// Fetch the given ids in one batch. Absent ids are simply missing
    /// from the result, never an error.
    async fn get(&self, typ: KeyType, ids: &[String]) -> StoreResult<KeyMap>;

    /// Apply a batch of writes and deletions atomically.
    async fn set(&self, data: &KeyMutations) -> StoreResult<()>;

    /// Drop everything. Optional for backends that cannot enumerate.
    async fn clear(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Convenience for building a single-entry mutation batch.
pub fn single_mutation(typ: KeyType, id: impl Into<String>, value: Option<Bytes>) -> KeyMutations {
    let mut inner = HashMap::new();
    inner.insert(id.into(), value);
    let mut out = HashMap::new();
    out.insert(typ, inner);
    out
}
