//! Group sender-key sessions.
//!
//! A sender key is a hash chain plus an Ed25519 signing key, shared with
//! every group member through a sender-key distribution message (SKDM).
//! One `skmsg` ciphertext then reaches the whole group.

use prost::Message as _;
use rand::Rng;

use crate::crypto::Hkdf;
use crate::error::{Result, WireError};
use crate::proto::wa;
use crate::signal::address::SignalAddress;
use crate::types::JID;

const INFO_GROUP_MESSAGE: &[u8] = b"WAWire Group Message Keys";

/// Store id for one `(group, sender)` sender key.
pub fn sender_key_store_id(group: &JID, sender: &SignalAddress) -> String {
    format!("{}::{}", group, sender)
}

fn chain_step(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let mut next = HmacSha256::new_from_slice(chain_key).expect("HMAC accepts any key size");
    next.update(&[0x01]);
    let mut message = HmacSha256::new_from_slice(chain_key).expect("HMAC accepts any key size");
    message.update(&[0x02]);

    (
        next.finalize().into_bytes().into(),
        message.finalize().into_bytes().into(),
    )
}

fn message_key_material(message_key: &[u8; 32]) -> ([u8; 32], [u8; 12]) {
    let expanded = Hkdf::derive(None, message_key, INFO_GROUP_MESSAGE, 44);
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    key.copy_from_slice(&expanded[0..32]);
    nonce.copy_from_slice(&expanded[32..44]);
    (key, nonce)
}

/// What a sender-key message signature covers.
fn signature_payload(id: u32, iteration: u32, ciphertext: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + ciphertext.len());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&iteration.to_be_bytes());
    payload.extend_from_slice(ciphertext);
    payload
}

/// One sender-key session; ours carries the signing seed, a peer's does not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderKeySession {
    pub state: wa::SenderKeyState,
}

impl SenderKeySession {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            state: wa::SenderKeyState::decode(data)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.state.encode_to_vec()
    }

    /// Create a fresh own sender key.
    pub fn create_own() -> Self {
        let mut rng = rand::thread_rng();
        let mut chain_key = [0u8; 32];
        rng.fill(&mut chain_key);
        let mut seed = [0u8; 32];
        rng.fill(&mut seed);
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);

        Self {
            state: wa::SenderKeyState {
                id: Some(rng.gen()),
                iteration: Some(0),
                chain_key: Some(chain_key.to_vec()),
                signing_public: Some(signing.verifying_key().to_bytes().to_vec()),
                signing_seed: Some(seed.to_vec()),
            },
        }
    }

    /// Adopt a peer's sender key from a distribution message.
    pub fn from_distribution(skdm: &wa::SenderKeyDistribution) -> Result<Self> {
        let chain_key = skdm
            .chain_key
            .clone()
            .ok_or_else(|| WireError::Signal("distribution missing chain key".to_string()))?;
        let signing_public = skdm
            .signing_key
            .clone()
            .ok_or_else(|| WireError::Signal("distribution missing signing key".to_string()))?;

        Ok(Self {
            state: wa::SenderKeyState {
                id: skdm.id,
                iteration: skdm.iteration,
                chain_key: Some(chain_key),
                signing_public: Some(signing_public),
                signing_seed: None,
            },
        })
    }

    /// Distribution message for the current chain state.
    pub fn distribution_message(&self) -> wa::SenderKeyDistribution {
        wa::SenderKeyDistribution {
            id: self.state.id,
            iteration: self.state.iteration,
            chain_key: self.state.chain_key.clone(),
            signing_key: self.state.signing_public.clone(),
        }
    }

    fn chain(&self) -> Result<[u8; 32]> {
        self.state
            .chain_key
            .as_deref()
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .ok_or_else(|| WireError::Signal("corrupt sender key state".to_string()))
    }

    /// Encrypt one group message, advancing the chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let seed: [u8; 32] = self
            .state
            .signing_seed
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Signal("not our sender key".to_string()))?;
        let id = self.state.id.unwrap_or(0);
        let iteration = self.state.iteration.unwrap_or(0);

        let (next_chain, message_key) = chain_step(&self.chain()?);
        let (key, nonce) = message_key_material(&message_key);
        let aad = signature_payload(id, iteration, &[]);
        let ciphertext = crate::crypto::aead_encrypt(&key, &nonce, plaintext, &aad)
            .map_err(|e| WireError::Signal(e.to_string()))?;

        use ed25519_dalek::Signer;
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let signature = signing
            .sign(&signature_payload(id, iteration, &ciphertext))
            .to_bytes();

        self.state.chain_key = Some(next_chain.to_vec());
        self.state.iteration = Some(iteration + 1);

        Ok(wa::SenderKeyMessage {
            id: Some(id),
            iteration: Some(iteration),
            ciphertext: Some(ciphertext),
            signature: Some(signature.to_vec()),
        }
        .encode_to_vec())
    }

    /// Decrypt one group message, advancing the chain to its iteration.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let message = wa::SenderKeyMessage::decode(data)?;
        let id = message.id.unwrap_or(0);
        let iteration = message
            .iteration
            .ok_or_else(|| WireError::Signal("sender key message missing iteration".to_string()))?;
        let ciphertext = message
            .ciphertext
            .as_deref()
            .ok_or_else(|| WireError::Signal("sender key message missing ciphertext".to_string()))?;

        if self.state.id != Some(id) {
            return Err(WireError::Signal("sender key id mismatch".to_string()));
        }

        // Signature check against the distributed signing key.
        let signing_public: [u8; 32] = self
            .state
            .signing_public
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Signal("corrupt sender key state".to_string()))?;
        let signature: [u8; 64] = message
            .signature
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Signal("sender key message missing signature".to_string()))?;
        if !crate::crypto::verify_identity_signature(
            &signing_public,
            &signature_payload(id, iteration, ciphertext),
            &signature,
        ) {
            return Err(WireError::Signal("sender key signature invalid".to_string()));
        }

        let current = self.state.iteration.unwrap_or(0);
        if iteration < current {
            return Err(WireError::Signal(format!(
                "sender key message replay at iteration {iteration}"
            )));
        }

        // Advance to the message's iteration, discarding skipped keys.
        let mut chain = self.chain()?;
        for _ in current..iteration {
            chain = chain_step(&chain).0;
        }
        let (next_chain, message_key) = chain_step(&chain);
        let (key, nonce) = message_key_material(&message_key);
        let aad = signature_payload(id, iteration, &[]);

        let plaintext = crate::crypto::aead_decrypt(&key, &nonce, ciphertext, &aad)
            .map_err(|_| WireError::Signal("group message authentication failed".to_string()))?;

        self.state.chain_key = Some(next_chain.to_vec());
        self.state.iteration = Some(iteration + 1);

        Ok(plaintext)
    }
}
