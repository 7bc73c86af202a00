//! Authentication credentials and pre-key lifecycle.
//!
//! Creds are generated once on a fresh install, mutated on every
//! successful handshake step and pre-key upload, and handed back to the
//! external blob store through `creds.update` events.

use base64::Engine;
use bytes::Bytes;
use prost::Message as _;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::traits::KeyType;
use super::transaction::TransactionalKeyStore;
use crate::crypto::{IdentityKeyPair, KeyPair, PreKey};
use crate::error::Result;
use crate::proto::wa;
use crate::types::JID;

/// A signed pre-key as kept in creds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub key_pair: KeyPair,
    pub key_id: u32,
    pub signature: Vec<u8>,
}

/// Per-account settings synced from the primary device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountSettings {
    pub unarchive_chats: bool,
}

/// Persistent authentication state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticationCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key: KeyPair,
    pub signed_identity_key: IdentityKeyPair,
    pub signed_pre_key: SignedPreKeyRecord,
    pub registration_id: u16,
    /// 32 random bytes, base64.
    pub adv_secret_key: String,
    pub processed_history_messages: Vec<String>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    pub account_sync_counter: u32,
    pub account_settings: AccountSettings,
    pub registered: bool,
    /// Serialized account-signed device identity, attached to stanzas
    /// whenever a recipient node carries a `pkmsg`.
    pub account: Option<Vec<u8>>,
    pub me: Option<JID>,
    pub my_lid: Option<JID>,
}

/// 16-bit registration id, never zero.
pub fn generate_registration_id() -> u16 {
    rand::thread_rng().gen_range(1..=u16::MAX)
}

/// Fresh-install credential initialisation.
pub fn init_auth_creds() -> AuthenticationCreds {
    let identity = IdentityKeyPair::generate();
    let signed_pre_key = PreKey::new_signed(1, &identity);

    let mut adv_secret = [0u8; 32];
    rand::thread_rng().fill(&mut adv_secret);

    AuthenticationCreds {
        noise_key: KeyPair::generate(),
        pairing_ephemeral_key: KeyPair::generate(),
        signed_identity_key: identity,
        signed_pre_key: SignedPreKeyRecord {
            key_pair: signed_pre_key.key_pair,
            key_id: signed_pre_key.key_id,
            signature: signed_pre_key.signature.unwrap_or_default(),
        },
        registration_id: generate_registration_id(),
        adv_secret_key: base64::engine::general_purpose::STANDARD.encode(adv_secret),
        processed_history_messages: Vec::new(),
        next_pre_key_id: 1,
        first_unuploaded_pre_key_id: 1,
        account_sync_counter: 0,
        account_settings: AccountSettings::default(),
        registered: false,
        account: None,
        me: None,
        my_lid: None,
    }
}

/// Fields mutated by a pre-key batch generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyUpdate {
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
}

/// Generate `count` fresh pre-keys starting at `next_pre_key_id`.
///
/// Ids are never reused: the range starts where the last batch ended,
/// regardless of what the store still holds.
pub fn generate_or_get_pre_keys(creds: &AuthenticationCreds, count: u32) -> Vec<PreKey> {
    (creds.next_pre_key_id..creds.next_pre_key_id + count)
        .map(PreKey::new)
        .collect()
}

/// Pre-key store serialization.
pub fn serialize_pre_key(pre_key: &PreKey) -> Bytes {
    let record = wa::PreKeyRecord {
        id: Some(pre_key.key_id),
        public: Some(pre_key.key_pair.public.to_vec()),
        private: Some(pre_key.key_pair.private.to_vec()),
    };
    Bytes::from(record.encode_to_vec())
}

/// Inverse of [`serialize_pre_key`].
pub fn deserialize_pre_key(id: u32, data: &[u8]) -> Result<PreKey> {
    let record = wa::PreKeyRecord::decode(data)?;
    let private: [u8; 32] = record
        .private
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| crate::error::WireError::StoreFailure("corrupt pre-key record".into()))?;
    Ok(PreKey {
        key_pair: KeyPair::from_private_key(private),
        key_id: record.id.unwrap_or(id),
        signature: None,
    })
}

/// Generate the next upload batch: writes the new keys to the store in one
/// batch and returns the creds update to apply and emit.
pub async fn get_next_pre_keys(
    store: &TransactionalKeyStore,
    creds: &AuthenticationCreds,
    count: u32,
) -> Result<(PreKeyUpdate, Vec<PreKey>)> {
    let pre_keys = generate_or_get_pre_keys(creds, count);

    let mut batch = std::collections::HashMap::new();
    for pre_key in &pre_keys {
        batch.insert(pre_key.key_id.to_string(), Some(serialize_pre_key(pre_key)));
    }
    let mut mutations = std::collections::HashMap::new();
    mutations.insert(KeyType::PreKey, batch);
    store.set(&mutations).await?;

    let last = creds.next_pre_key_id + count;
    let update = PreKeyUpdate {
        next_pre_key_id: last,
        first_unuploaded_pre_key_id: last.max(creds.first_unuploaded_pre_key_id),
    };

    Ok((update, pre_keys))
}

impl AuthenticationCreds {
    pub fn apply_pre_key_update(&mut self, update: &PreKeyUpdate) {
        self.next_pre_key_id = update.next_pre_key_id;
        self.first_unuploaded_pre_key_id = update.first_unuploaded_pre_key_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryKeyStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fresh_creds_shape() {
        let creds = init_auth_creds();
        assert_eq!(creds.signed_pre_key.key_id, 1);
        assert_eq!(creds.next_pre_key_id, 1);
        assert_eq!(creds.first_unuploaded_pre_key_id, 1);
        assert!(!creds.registered);
        assert!(creds.registration_id > 0);

        let secret = base64::engine::general_purpose::STANDARD
            .decode(&creds.adv_secret_key)
            .unwrap();
        assert_eq!(secret.len(), 32);

        // signed pre-key carries a valid identity signature
        assert!(crate::crypto::verify_prekey_signature(
            &creds.signed_identity_key.public_bytes(),
            &creds.signed_pre_key.key_pair.public,
            &creds.signed_pre_key.signature,
        ));
    }

    #[test]
    fn test_creds_serde_roundtrip() {
        let creds = init_auth_creds();
        let json = serde_json::to_string(&creds).unwrap();
        let back: AuthenticationCreds = serde_json::from_str(&json).unwrap();
        assert_eq!(back.registration_id, creds.registration_id);
        assert_eq!(back.noise_key.public, creds.noise_key.public);
        assert_eq!(back.signed_pre_key.signature, creds.signed_pre_key.signature);
    }

    #[test]
    fn test_pre_key_ids_never_reused() {
        let mut creds = init_auth_creds();
        creds.next_pre_key_id = 10;

        let batch = generate_or_get_pre_keys(&creds, 5);
        let ids: Vec<u32> = batch.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        assert!(ids.iter().all(|&id| id >= creds.next_pre_key_id));
    }

    #[tokio::test]
    async fn test_get_next_pre_keys_scenario() {
        use crate::store::traits::{KeyMap, KeyMutations, SignalKeyStore, StoreResult};
        use async_trait::async_trait;

        struct CountingSets {
            inner: MemoryKeyStore,
            sets: AtomicUsize,
        }

        #[async_trait]
        impl SignalKeyStore for CountingSets {
            async fn get(&self, typ: KeyType, ids: &[String]) -> StoreResult<KeyMap> {
                self.inner.get(typ, ids).await
            }
            async fn set(&self, data: &KeyMutations) -> StoreResult<()> {
                self.sets.fetch_add(1, Ordering::SeqCst);
                self.inner.set(data).await
            }
        }

        let backend = Arc::new(CountingSets {
            inner: MemoryKeyStore::new(),
            sets: AtomicUsize::new(0),
        });
        let store = TransactionalKeyStore::new(backend.clone());

        let mut creds = init_auth_creds();
        creds.next_pre_key_id = 10;
        creds.first_unuploaded_pre_key_id = 10;

        let (update, new_keys) = get_next_pre_keys(&store, &creds, 5).await.unwrap();

        let ids: Vec<u32> = new_keys.iter().map(|k| k.key_id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        assert_eq!(update.next_pre_key_id, 15);
        assert_eq!(update.first_unuploaded_pre_key_id, 15);
        // exactly one pre-key write batch
        assert_eq!(backend.sets.load(Ordering::SeqCst), 1);

        creds.apply_pre_key_update(&update);
        assert_eq!(creds.next_pre_key_id, 15);
    }

    #[tokio::test]
    async fn test_pre_key_store_roundtrip() {
        let store = TransactionalKeyStore::new(Arc::new(MemoryKeyStore::new()));
        let creds = init_auth_creds();

        let (_, keys) = get_next_pre_keys(&store, &creds, 2).await.unwrap();
        let fetched = store
            .get(KeyType::PreKey, &[keys[0].key_id.to_string()])
            .await
            .unwrap();
        let data = fetched.get(&keys[0].key_id.to_string()).unwrap();
        let back = deserialize_pre_key(keys[0].key_id, data).unwrap();
        assert_eq!(back.key_pair.public, keys[0].key_pair.public);
        assert_eq!(back.key_pair.private, keys[0].key_pair.private);
    }
}
