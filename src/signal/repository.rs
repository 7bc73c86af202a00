//! The signal repository: pairwise and group encryption over the
//! transactional key store.
//!
//! Every entry point expects to run inside an outer store transaction
//! started by the caller, which makes the session read/modify/write
//! cycles atomic with respect to the rest of the outbound path.

use bytes::Bytes;
use prost::Message as _;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Result, WireError};
use crate::proto::wa;
use crate::signal::address::{jid_to_signal_address, SignalAddress};
use crate::signal::group::{sender_key_store_id, SenderKeySession};
use crate::signal::session::{EncType, PreKeyBundle, Session};
use crate::store::creds::deserialize_pre_key;
use crate::store::traits::{single_mutation, KeyType};
use crate::store::{AuthenticationCreds, TransactionalKeyStore};
use crate::types::JID;

/// Result of a pairwise encryption.
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    pub enc_type: &'static str,
    pub ciphertext: Vec<u8>,
}

/// Result of a group encryption.
#[derive(Debug, Clone)]
pub struct GroupEncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub sender_key_distribution_message: Vec<u8>,
}

/// Signal protocol operations bound to the key store and creds.
pub struct SignalRepository {
    store: Arc<TransactionalKeyStore>,
    creds: Arc<Mutex<AuthenticationCreds>>,
}

impl SignalRepository {
    pub fn new(store: Arc<TransactionalKeyStore>, creds: Arc<Mutex<AuthenticationCreds>>) -> Self {
        Self { store, creds }
    }

    pub fn store(&self) -> &Arc<TransactionalKeyStore> {
        &self.store
    }

    async fn load_session(&self, address: &SignalAddress) -> Result<Option<Session>> {
        let id = address.to_string();
        let found = self.store.get(KeyType::Session, &[id.clone()]).await?;
        match found.get(&id) {
            Some(data) => Ok(Some(Session::from_bytes(data)?)),
            None => Ok(None),
        }
    }

    async fn save_session(&self, address: &SignalAddress, session: &Session) -> Result<()> {
        self.store
            .set(&single_mutation(
                KeyType::Session,
                address.to_string(),
                Some(Bytes::from(session.to_bytes())),
            ))
            .await
    }

    pub async fn has_session(&self, jid: &JID) -> Result<bool> {
        let address = jid_to_signal_address(jid);
        Ok(self.load_session(&address).await?.is_some())
    }

    /// Build a fresh pairwise session from a peer's prekey bundle.
    pub async fn inject_e2e_session(&self, jid: &JID, bundle: &PreKeyBundle) -> Result<()> {
        let address = jid_to_signal_address(jid);
        let (identity, registration_id) = {
            let creds = self.creds.lock().await;
            (creds.signed_identity_key.clone(), creds.registration_id as u32)
        };
        let session = Session::initiate(&identity, registration_id, bundle)?;
        self.save_session(&address, &session).await
    }

    /// Encrypt a pairwise message; `pkmsg` until the session completes a
    /// round-trip, `msg` thereafter.
    pub async fn encrypt_message(&self, jid: &JID, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let address = jid_to_signal_address(jid);
        let mut session = self
            .load_session(&address)
            .await?
            .ok_or_else(|| WireError::NoSession(address.to_string()))?;

        let identity = self.creds.lock().await.signed_identity_key.clone();
        let (enc_type, ciphertext) = session.encrypt(&identity, plaintext)?;
        self.save_session(&address, &session).await?;

        Ok(EncryptedMessage {
            enc_type: match enc_type {
                EncType::PkMsg => "pkmsg",
                EncType::Msg => "msg",
            },
            ciphertext,
        })
    }

    /// Decrypt a pairwise message of either enc type.
    pub async fn decrypt_message(&self, jid: &JID, enc_type: &str, data: &[u8]) -> Result<Vec<u8>> {
        match enc_type {
            "pkmsg" => self.decrypt_pre_key_message(jid, data).await,
            "msg" => self.decrypt_ratchet_message(jid, data).await,
            other => Err(WireError::Signal(format!("unknown enc type {other}"))),
        }
    }

    async fn decrypt_ratchet_message(&self, jid: &JID, data: &[u8]) -> Result<Vec<u8>> {
        let address = jid_to_signal_address(jid);
        let mut session = self
            .load_session(&address)
            .await?
            .ok_or_else(|| WireError::NoSession(address.to_string()))?;
        let plaintext = session.decrypt(data)?;
        self.save_session(&address, &session).await?;
        Ok(plaintext)
    }

    async fn decrypt_pre_key_message(&self, jid: &JID, data: &[u8]) -> Result<Vec<u8>> {
        let address = jid_to_signal_address(jid);
        let pre_key_message = wa::PreKeySignalMessage::decode(data)?;

        let their_identity: [u8; 32] = pre_key_message
            .identity_key
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Signal("pkmsg missing identity key".to_string()))?;
        let base_key: [u8; 32] = pre_key_message
            .base_key
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Signal("pkmsg missing base key".to_string()))?;
        let inner = pre_key_message
            .message
            .as_deref()
            .ok_or_else(|| WireError::Signal("pkmsg missing inner message".to_string()))?;

        // Reuse the session when this is a replay of the same handshake.
        let existing = self.load_session(&address).await?;
        let mut session = match existing {
            Some(session) if session.matches_base_key(&base_key) => session,
            _ => {
                let (identity, signed_pre_key, signed_pre_key_id) = {
                    let creds = self.creds.lock().await;
                    (
                        creds.signed_identity_key.clone(),
                        creds.signed_pre_key.key_pair.clone(),
                        creds.signed_pre_key.key_id,
                    )
                };

                if pre_key_message.signed_pre_key_id != Some(signed_pre_key_id) {
                    return Err(WireError::Signal("unknown signed pre-key id".to_string()));
                }

                let one_time = match pre_key_message.pre_key_id {
                    Some(id) => Some(self.consume_one_time_pre_key(id).await?),
                    None => None,
                };

                Session::respond(
                    &identity,
                    &signed_pre_key,
                    one_time.as_ref().map(|k| &k.key_pair),
                    &their_identity,
                    &base_key,
                )?
            }
        };

        let plaintext = session.decrypt(inner)?;
        self.save_session(&address, &session).await?;
        Ok(plaintext)
    }

    /// Fetch and delete the referenced one-time pre-key. The deletion is a
    /// buffered mutation, so it only lands if the outer transaction commits.
    async fn consume_one_time_pre_key(&self, id: u32) -> Result<crate::crypto::PreKey> {
        let key_id = id.to_string();
        let found = self.store.get(KeyType::PreKey, &[key_id.clone()]).await?;
        let data = found
            .get(&key_id)
            .ok_or_else(|| WireError::Signal(format!("one-time pre-key {id} not found")))?;
        let pre_key = deserialize_pre_key(id, data)?;
        self.store
            .set(&single_mutation(KeyType::PreKey, key_id, None))
            .await?;
        Ok(pre_key)
    }

    /// Encrypt for a group, creating our sender key on first use. Returns
    /// both the `skmsg` ciphertext and the SKDM new recipients need.
    pub async fn encrypt_group_message(
        &self,
        group: &JID,
        me: &JID,
        plaintext: &[u8],
    ) -> Result<GroupEncryptedMessage> {
        let sender = jid_to_signal_address(me);
        let id = sender_key_store_id(group, &sender);

        let found = self.store.get(KeyType::SenderKey, &[id.clone()]).await?;
        let mut session = match found.get(&id) {
            Some(data) => SenderKeySession::from_bytes(data)?,
            None => SenderKeySession::create_own(),
        };

        let distribution = session.distribution_message().encode_to_vec();
        let ciphertext = session.encrypt(plaintext)?;

        self.store
            .set(&single_mutation(
                KeyType::SenderKey,
                id,
                Some(Bytes::from(session.to_bytes())),
            ))
            .await?;

        Ok(GroupEncryptedMessage {
            ciphertext,
            sender_key_distribution_message: distribution,
        })
    }

    /// Decrypt a group message from `sender`.
    pub async fn decrypt_group_message(
        &self,
        group: &JID,
        sender: &JID,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let address = jid_to_signal_address(sender);
        let id = sender_key_store_id(group, &address);

        let found = self.store.get(KeyType::SenderKey, &[id.clone()]).await?;
        let mut session = match found.get(&id) {
            Some(data) => SenderKeySession::from_bytes(data)?,
            None => return Err(WireError::NoSession(id)),
        };

        let plaintext = session.decrypt(data)?;
        self.store
            .set(&single_mutation(
                KeyType::SenderKey,
                id,
                Some(Bytes::from(session.to_bytes())),
            ))
            .await?;
        Ok(plaintext)
    }

    /// Store a peer's sender key from an SKDM.
    pub async fn process_sender_key_distribution(
        &self,
        group: &JID,
        sender: &JID,
        skdm: &[u8],
    ) -> Result<()> {
        let distribution = wa::SenderKeyDistribution::decode(skdm)?;
        let session = SenderKeySession::from_distribution(&distribution)?;
        let address = jid_to_signal_address(sender);
        let id = sender_key_store_id(group, &address);
        self.store
            .set(&single_mutation(
                KeyType::SenderKey,
                id,
                Some(Bytes::from(session.to_bytes())),
            ))
            .await
    }
}

/// Version-2 message padding: 1..=16 bytes, each holding the pad length.
pub fn pad_message_v2(mut plaintext: Vec<u8>) -> Vec<u8> {
    use rand::Rng;
    let pad: u8 = rand::thread_rng().gen_range(1..=16);
    plaintext.extend(std::iter::repeat(pad).take(pad as usize));
    plaintext
}

/// Inverse of [`pad_message_v2`].
pub fn unpad_message_v2(padded: &[u8]) -> Result<&[u8]> {
    let &pad = padded
        .last()
        .ok_or_else(|| WireError::Signal("empty padded message".to_string()))?;
    if pad == 0 || pad > 16 || padded.len() < pad as usize {
        return Err(WireError::Signal("invalid message padding".to_string()));
    }
    Ok(&padded[..padded.len() - pad as usize])
}
