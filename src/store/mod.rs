//! Key-store stack: opaque blob contract, read-through cache,
//! transactional write-behind, credentials.

pub mod cache;
pub mod creds;
pub mod memory;
pub mod traits;
pub mod transaction;

pub use cache::{CachedKeyStore, DEFAULT_CACHE_TTL};
pub use creds::{
    generate_or_get_pre_keys, get_next_pre_keys, init_auth_creds, AuthenticationCreds,
    PreKeyUpdate, SignedPreKeyRecord,
};
pub use memory::MemoryKeyStore;
pub use traits::{KeyMap, KeyMutations, KeyType, SignalKeyStore, StoreError, StoreResult};
pub use transaction::{TransactionOpts, TransactionalKeyStore};

use std::sync::Arc;

/// Stack the cache and transaction layers over an external store.
pub fn make_transactional(store: Arc<dyn SignalKeyStore>) -> Arc<TransactionalKeyStore> {
    let cached = Arc::new(CachedKeyStore::new(store));
    Arc::new(TransactionalKeyStore::new(cached))
}
