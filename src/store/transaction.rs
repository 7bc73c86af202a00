//! Transactional write-behind layer over the key store.
//!
//! `transaction(work)` batches every write made inside `work` and commits
//! them in one backing `set` on outermost exit, with bounded retries.
//! Reads inside the transaction see the batched writes; concurrent
//! observers do not, until the commit lands. Nested transactions share the
//! outer transaction's state and only the outermost commits.

use bytes::Bytes;
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::{KeyMap, KeyMutations, KeyType, SignalKeyStore};
use crate::error::{Result, WireError};

/// Commit retry policy.
#[derive(Debug, Clone)]
pub struct TransactionOpts {
    pub max_commit_retries: u32,
    pub delay_between_tries: Duration,
}

impl Default for TransactionOpts {
    fn default() -> Self {
        Self {
            max_commit_retries: 5,
            delay_between_tries: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct TxState {
    depth: u32,
    /// Values visible inside the transaction: fetched entries and writes.
    /// `None` marks an in-transaction deletion.
    cache: HashMap<KeyType, HashMap<String, Option<Bytes>>>,
    mutations: KeyMutations,
    queries: usize,
}

/// Transaction-aware adapter over a (typically cached) key store.
pub struct TransactionalKeyStore {
    inner: Arc<dyn SignalKeyStore>,
    opts: TransactionOpts,
    state: Mutex<TxState>,
}

impl TransactionalKeyStore {
    pub fn new(inner: Arc<dyn SignalKeyStore>) -> Self {
        Self::with_opts(inner, TransactionOpts::default())
    }

    pub fn with_opts(inner: Arc<dyn SignalKeyStore>, opts: TransactionOpts) -> Self {
        Self {
            inner,
            opts,
            state: Mutex::new(TxState::default()),
        }
    }

    pub async fn is_in_transaction(&self) -> bool {
        self.state.lock().await.depth > 0
    }

    /// Batched read; consults the transaction cache first when one is open.
    pub async fn get(&self, typ: KeyType, ids: &[String]) -> Result<KeyMap> {
        {
            let state = self.state.lock().await;
            if state.depth == 0 {
                drop(state);
                return Ok(self.inner.get(typ, ids).await?);
            }
        }

        // Inside a transaction: split between tx-cached and unfetched ids.
        let mut result = KeyMap::new();
        let mut to_fetch = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.queries += 1;
            let type_cache = state.cache.entry(typ).or_default();
            for id in ids {
                match type_cache.get(id) {
                    Some(Some(value)) => {
                        result.insert(id.clone(), value.clone());
                    }
                    Some(None) => {} // deleted within this transaction
                    None => to_fetch.push(id.clone()),
                }
            }
        }

        if !to_fetch.is_empty() {
            debug!(target: "Store/Tx", "fetching {} {typ} keys inside transaction", to_fetch.len());
            let fetched = self.inner.get(typ, &to_fetch).await?;
            let mut state = self.state.lock().await;
            let type_cache = state.cache.entry(typ).or_default();
            for (id, value) in fetched {
                type_cache.insert(id.clone(), Some(value.clone()));
                result.insert(id, value);
            }
        }

        Ok(result)
    }

    /// Batched write; buffered until commit when a transaction is open.
    pub async fn set(&self, data: &KeyMutations) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.depth == 0 {
            drop(state);
            self.inner.set(data).await?;
            return Ok(());
        }

        for (typ, ids) in data {
            for (id, value) in ids {
                state
                    .cache
                    .entry(*typ)
                    .or_default()
                    .insert(id.clone(), value.clone());
                state
                    .mutations
                    .entry(*typ)
                    .or_default()
                    .insert(id.clone(), value.clone());
            }
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.cache.clear();
        state.mutations.clear();
        drop(state);
        self.inner.clear().await?;
        Ok(())
    }

    /// Run `work` inside a (possibly nested) transaction.
    ///
    /// Only the outermost call commits; a failing workload never does.
    pub async fn transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut state = self.state.lock().await;
            state.depth += 1;
        }

        let result = work().await;

        let (outermost, mutations, queries) = {
            let mut state = self.state.lock().await;
            state.depth -= 1;
            if state.depth > 0 {
                (false, KeyMutations::new(), 0)
            } else {
                let mutations = std::mem::take(&mut state.mutations);
                let queries = std::mem::take(&mut state.queries);
                state.cache.clear();
                (true, mutations, queries)
            }
        };

        if !outermost {
            return result;
        }

        let value = match result {
            Ok(value) => value,
            Err(err) => return Err(err), // aborted: mutations discarded above
        };

        if mutations.is_empty() {
            return Ok(value);
        }

        debug!(
            target: "Store/Tx",
            "committing transaction ({} key types, {queries} queries)",
            mutations.len()
        );
        self.commit(&mutations).await?;
        Ok(value)
    }

    async fn commit(&self, mutations: &KeyMutations) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.set(mutations).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.opts.max_commit_retries => {
                    warn!(
                        target: "Store/Tx",
                        "commit attempt {attempt}/{} failed: {err}, retrying",
                        self.opts.max_commit_retries
                    );
                    tokio::time::sleep(self.opts.delay_between_tries).await;
                }
                Err(err) => {
                    return Err(WireError::CommitFailure {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}
