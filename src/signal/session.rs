//! Pairwise double-ratchet sessions.
//!
//! A session is bootstrapped either from a peer's prekey bundle (we
//! initiate) or from an incoming `pkmsg` (they initiate). After the
//! handshake both sides run symmetric DH ratchet steps; each message
//! advances a hash chain whose output keys AES-GCM.

use prost::Message as _;

use crate::crypto::{
    aead_decrypt, aead_encrypt, dh_with_identity, derive_key_pair, verify_prekey_signature, Hkdf,
    IdentityKeyPair, KeyPair,
};
use crate::error::{Result, WireError};
use crate::proto::wa;

const INFO_AGREEMENT: &[u8] = b"WAWire Agreement";
const INFO_RATCHET: &[u8] = b"WAWire Ratchet";
const INFO_MESSAGE: &[u8] = b"WAWire Message Keys";

/// Ceiling on retained out-of-order message keys per session.
const MAX_SKIPPED_KEYS: usize = 2000;

/// A peer's published prekey bundle.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    /// Ed25519 identity key; the Montgomery form is derived for agreement.
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    pub signed_pre_key_signature: Vec<u8>,
    pub pre_key: Option<(u32, [u8; 32])>,
}

/// The two ciphertext forms a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncType {
    /// Session-establishing message carrying the handshake header.
    PkMsg,
    /// Plain ratchet message.
    Msg,
}

impl EncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncType::PkMsg => "pkmsg",
            EncType::Msg => "msg",
        }
    }
}

/// In-memory view of one session record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub record: wa::SessionStructure,
}

fn key32(bytes: Option<&Vec<u8>>) -> Result<[u8; 32]> {
    bytes
        .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
        .ok_or_else(|| WireError::Signal("corrupt session record".to_string()))
}

/// One hash-chain step: next chain key and this message's key.
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

/// Root-key ratchet step.
fn kdf_root(root: &[u8; 32], dh: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    derive_key_pair(root, dh, INFO_RATCHET)
}

/// Expand a message key into an AEAD key and nonce.
fn message_key_material(message_key: &[u8; 32]) -> ([u8; 32], [u8; 12]) {
    let expanded = Hkdf::derive(None, message_key, INFO_MESSAGE, 44);
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    key.copy_from_slice(&expanded[0..32]);
    nonce.copy_from_slice(&expanded[32..44]);
    (key, nonce)
}

/// X3DH-style master secret from the individual agreements.
fn master_secret(dh1: [u8; 32], dh2: [u8; 32], dh3: [u8; 32], dh4: Option<[u8; 32]>) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(&[0xFF; 32]);
    ikm.extend_from_slice(&dh1);
    ikm.extend_from_slice(&dh2);
    ikm.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(&dh4);
    }
    let derived = Hkdf::derive(None, &ikm, INFO_AGREEMENT, 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&derived);
    out
}

impl Session {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            record: wa::SessionStructure::decode(data)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.record.encode_to_vec()
    }

    /// Whether the next outbound message still carries the handshake header.
    pub fn is_pending_establishment(&self) -> bool {
        self.record.pending_pre_key.is_some()
    }

    /// Build an initiator session from a peer's prekey bundle.
    pub fn initiate(
        our_identity: &IdentityKeyPair,
        our_registration_id: u32,
        bundle: &PreKeyBundle,
    ) -> Result<Self> {
        if !verify_prekey_signature(
            &bundle.identity_key,
            &bundle.signed_pre_key_public,
            &bundle.signed_pre_key_signature,
        ) {
            return Err(WireError::Signal("prekey bundle signature invalid".to_string()));
        }

        let base = KeyPair::generate();

        let dh1 = our_identity.dh_with_public(&bundle.signed_pre_key_public);
        let dh2 = dh_with_identity(&base, &bundle.identity_key)
            .map_err(|e| WireError::Signal(e.to_string()))?;
        let dh3 = base.dh(&bundle.signed_pre_key_public);
        let dh4 = bundle.pre_key.map(|(_, otp)| base.dh(&otp));

        let root0 = master_secret(dh1, dh2, dh3, dh4);

        // First DH ratchet against the peer's signed pre-key.
        let ratchet = KeyPair::generate();
        let (root, send_chain) = kdf_root(&root0, &ratchet.dh(&bundle.signed_pre_key_public));

        Ok(Self {
            record: wa::SessionStructure {
                registration_id: Some(our_registration_id),
                their_identity: Some(bundle.identity_key.to_vec()),
                root_key: Some(root.to_vec()),
                our_ratchet_private: Some(ratchet.private.to_vec()),
                our_ratchet_public: Some(ratchet.public.to_vec()),
                their_ratchet_public: Some(bundle.signed_pre_key_public.to_vec()),
                send_chain_key: Some(send_chain.to_vec()),
                send_chain_index: Some(0),
                previous_send_counter: Some(0),
                pending_pre_key: Some(wa::PendingPreKey {
                    pre_key_id: bundle.pre_key.map(|(id, _)| id),
                    signed_pre_key_id: Some(bundle.signed_pre_key_id),
                    base_key: Some(base.public.to_vec()),
                }),
                ..Default::default()
            },
        })
    }

    /// Build a responder session from an incoming handshake header.
    pub fn respond(
        our_identity: &IdentityKeyPair,
        our_signed_pre_key: &KeyPair,
        our_one_time_pre_key: Option<&KeyPair>,
        their_identity: &[u8; 32],
        their_base_key: &[u8; 32],
    ) -> Result<Self> {
        let dh1 = dh_with_identity(our_signed_pre_key, their_identity)
            .map_err(|e| WireError::Signal(e.to_string()))?;
        let dh2 = our_identity.dh_with_public(their_base_key);
        let dh3 = our_signed_pre_key.dh(their_base_key);
        let dh4 = our_one_time_pre_key.map(|otp| otp.dh(their_base_key));

        let root0 = master_secret(dh1, dh2, dh3, dh4);

        // Our first ratchet key is the signed pre-key the peer targeted;
        // the first inbound message triggers the DH step that derives the
        // matching receive chain.
        Ok(Self {
            record: wa::SessionStructure {
                their_identity: Some(their_identity.to_vec()),
                root_key: Some(root0.to_vec()),
                our_ratchet_private: Some(our_signed_pre_key.private.to_vec()),
                our_ratchet_public: Some(our_signed_pre_key.public.to_vec()),
                their_base_key: Some(their_base_key.to_vec()),
                previous_send_counter: Some(0),
                ..Default::default()
            },
        })
    }

    /// Whether this responder session was built from the given base key.
    pub fn matches_base_key(&self, base_key: &[u8]) -> bool {
        self.record.their_base_key.as_deref() == Some(base_key)
    }

    /// Encrypt one message, advancing the send chain.
    pub fn encrypt(
        &mut self,
        our_identity: &IdentityKeyPair,
        plaintext: &[u8],
    ) -> Result<(EncType, Vec<u8>)> {
        let chain_key = key32(self.record.send_chain_key.as_ref())
            .map_err(|_| WireError::Signal("session has no send chain".to_string()))?;
        let index = self.record.send_chain_index.unwrap_or(0);

        let (next_chain, message_key) = chain_step(&chain_key);
        let (key, nonce) = message_key_material(&message_key);

        let header = wa::RatchetHeader {
            ratchet_key: self.record.our_ratchet_public.clone(),
            counter: Some(index),
            previous_counter: self.record.previous_send_counter,
        };
        let header_bytes = header.encode_to_vec();

        let ciphertext = aead_encrypt(&key, &nonce, plaintext, &header_bytes)
            .map_err(|e| WireError::Signal(e.to_string()))?;

        self.record.send_chain_key = Some(next_chain.to_vec());
        self.record.send_chain_index = Some(index + 1);

        let signal_message = wa::SignalMessage {
            header: Some(header),
            ciphertext: Some(ciphertext),
        }
        .encode_to_vec();

        match &self.record.pending_pre_key {
            Some(pending) => {
                let pre_key_message = wa::PreKeySignalMessage {
                    registration_id: self.record.registration_id,
                    pre_key_id: pending.pre_key_id,
                    signed_pre_key_id: pending.signed_pre_key_id,
                    base_key: pending.base_key.clone(),
                    identity_key: Some(our_identity.public_bytes().to_vec()),
                    message: Some(signal_message),
                }
                .encode_to_vec();
                Ok((EncType::PkMsg, pre_key_message))
            }
            None => Ok((EncType::Msg, signal_message)),
        }
    }

    /// Decrypt a plain ratchet message, advancing ratchets as needed.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let message = wa::SignalMessage::decode(data)?;
        let header = message
            .header
            .clone()
            .ok_or_else(|| WireError::Signal("message missing ratchet header".to_string()))?;
        let their_ratchet: [u8; 32] = header
            .ratchet_key
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Signal("message missing ratchet key".to_string()))?;
        let counter = header.counter.unwrap_or(0);
        let ciphertext = message
            .ciphertext
            .as_deref()
            .ok_or_else(|| WireError::Signal("message missing ciphertext".to_string()))?;
        let header_bytes = header.encode_to_vec();

        if self.record.their_ratchet_public.as_deref() != Some(their_ratchet.as_slice()) {
            self.ratchet_step(&their_ratchet, header.previous_counter.unwrap_or(0))?;
        }

        let message_key = self.take_message_key(&their_ratchet, counter)?;
        let (key, nonce) = message_key_material(&message_key);
        let plaintext = aead_decrypt(&key, &nonce, ciphertext, &header_bytes)
            .map_err(|_| WireError::Signal("message authentication failed".to_string()))?;

        // Any successful inbound message proves the peer holds the session.
        self.record.pending_pre_key = None;

        Ok(plaintext)
    }

    /// DH ratchet step for a newly seen remote ratchet key.
    fn ratchet_step(&mut self, their_ratchet: &[u8; 32], previous_counter: u32) -> Result<()> {
        // Park the remainder of the current receive chain.
        if self.record.recv_chain_key.is_some() {
            let old_ratchet = self.record.their_ratchet_public.clone().unwrap_or_default();
            self.skip_to(&old_ratchet, previous_counter)?;
        }

        let our_ratchet = KeyPair::from_private_key(key32(self.record.our_ratchet_private.as_ref())?);
        let root = key32(self.record.root_key.as_ref())?;

        let (root, recv_chain) = kdf_root(&root, &our_ratchet.dh(their_ratchet));

        let new_ratchet = KeyPair::generate();
        let (root, send_chain) = kdf_root(&root, &new_ratchet.dh(their_ratchet));

        self.record.previous_send_counter = self.record.send_chain_index;
        self.record.root_key = Some(root.to_vec());
        self.record.their_ratchet_public = Some(their_ratchet.to_vec());
        self.record.recv_chain_key = Some(recv_chain.to_vec());
        self.record.recv_chain_index = Some(0);
        self.record.our_ratchet_private = Some(new_ratchet.private.to_vec());
        self.record.our_ratchet_public = Some(new_ratchet.public.to_vec());
        self.record.send_chain_key = Some(send_chain.to_vec());
        self.record.send_chain_index = Some(0);

        Ok(())
    }

    /// Advance the receive chain up to `target`, parking skipped keys.
    fn skip_to(&mut self, ratchet_key: &[u8], target: u32) -> Result<()> {
        let mut chain = key32(self.record.recv_chain_key.as_ref())?;
        let mut index = self.record.recv_chain_index.unwrap_or(0);

        while index < target {
            if self.record.skipped_keys.len() >= MAX_SKIPPED_KEYS {
                return Err(WireError::Signal("too many skipped message keys".to_string()));
            }
            let (next, message_key) = chain_step(&chain);
            self.record.skipped_keys.push(wa::SkippedMessageKey {
                ratchet_key: Some(ratchet_key.to_vec()),
                index: Some(index),
                message_key: Some(message_key.to_vec()),
            });
            chain = next;
            index += 1;
        }

        self.record.recv_chain_key = Some(chain.to_vec());
        self.record.recv_chain_index = Some(index);
        Ok(())
    }

    /// Message key for `counter` on the chain keyed by `ratchet_key`.
    fn take_message_key(&mut self, ratchet_key: &[u8; 32], counter: u32) -> Result<[u8; 32]> {
        let index = self.record.recv_chain_index.unwrap_or(0);

        if counter < index {
            // Out-of-order delivery: the key must have been parked.
            let position = self
                .record
                .skipped_keys
                .iter()
                .position(|k| {
                    k.ratchet_key.as_deref() == Some(ratchet_key.as_slice())
                        && k.index == Some(counter)
                })
                .ok_or_else(|| WireError::Signal(format!("message replay at counter {counter}")))?;
            let skipped = self.record.skipped_keys.remove(position);
            return key32(skipped.message_key.as_ref());
        }

        self.skip_to(ratchet_key, counter)?;

        let chain = key32(self.record.recv_chain_key.as_ref())?;
        let (next, message_key) = chain_step(&chain);
        self.record.recv_chain_key = Some(next.to_vec());
        self.record.recv_chain_index = Some(counter + 1);
        Ok(message_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PreKey;

    struct Party {
        identity: IdentityKeyPair,
        signed_pre_key: PreKey,
        one_time: PreKey,
    }

    impl Party {
        fn new() -> Self {
            let identity = IdentityKeyPair::generate();
            let signed_pre_key = PreKey::new_signed(1, &identity);
            Self {
                identity,
                signed_pre_key,
                one_time: PreKey::new(17),
            }
        }

        fn bundle(&self) -> PreKeyBundle {
            PreKeyBundle {
                registration_id: 4321,
                identity_key: self.identity.public_bytes(),
                signed_pre_key_id: self.signed_pre_key.key_id,
                signed_pre_key_public: self.signed_pre_key.key_pair.public,
                signed_pre_key_signature: self.signed_pre_key.signature.clone().unwrap(),
                pre_key: Some((self.one_time.key_id, self.one_time.key_pair.public)),
            }
        }
    }

    fn establish() -> (Session, Session, IdentityKeyPair, IdentityKeyPair) {
        let alice_identity = IdentityKeyPair::generate();
        let bob = Party::new();

        let mut alice = Session::initiate(&alice_identity, 111, &bob.bundle()).unwrap();
        assert!(alice.is_pending_establishment());

        let (enc_type, wire) = alice.encrypt(&alice_identity, b"first contact").unwrap();
        assert_eq!(enc_type, EncType::PkMsg);

        let pkmsg = wa::PreKeySignalMessage::decode(wire.as_slice()).unwrap();
        let their_identity: [u8; 32] = pkmsg.identity_key.as_deref().unwrap().try_into().unwrap();
        let base_key: [u8; 32] = pkmsg.base_key.as_deref().unwrap().try_into().unwrap();

        let mut bob_session = Session::respond(
            &bob.identity,
            &bob.signed_pre_key.key_pair,
            Some(&bob.one_time.key_pair),
            &their_identity,
            &base_key,
        )
        .unwrap();

        let plaintext = bob_session.decrypt(pkmsg.message.as_deref().unwrap()).unwrap();
        assert_eq!(plaintext, b"first contact");

        (alice, bob_session, alice_identity, bob.identity.clone())
    }

    #[test]
    fn test_establish_and_first_message() {
        establish();
    }

    #[test]
    fn test_pkmsg_until_first_reply() {
        let (mut alice, mut bob_session, alice_identity, bob_identity) = establish();

        // Alice keeps sending pkmsg until she hears back.
        let (enc_type, wire) = alice.encrypt(&alice_identity, b"still handshaking").unwrap();
        assert_eq!(enc_type, EncType::PkMsg);
        let pkmsg = wa::PreKeySignalMessage::decode(wire.as_slice()).unwrap();
        assert_eq!(
            bob_session.decrypt(pkmsg.message.as_deref().unwrap()).unwrap(),
            b"still handshaking"
        );

        // Bob replies; Alice's session settles into plain messages.
        let (enc_type, reply) = bob_session.encrypt(&bob_identity, b"ack").unwrap();
        assert_eq!(enc_type, EncType::Msg);
        assert_eq!(alice.decrypt(&reply).unwrap(), b"ack");

        let (enc_type, _) = alice.encrypt(&alice_identity, b"settled").unwrap();
        assert_eq!(enc_type, EncType::Msg);
    }

    #[test]
    fn test_long_alternating_conversation() {
        let (mut alice, mut bob, alice_identity, bob_identity) = establish();

        for round in 0..6 {
            let text = format!("alice round {round}");
            let (_, wire) = alice.encrypt(&alice_identity, text.as_bytes()).unwrap();
            let wire = if alice.is_pending_establishment() {
                wa::PreKeySignalMessage::decode(wire.as_slice())
                    .unwrap()
                    .message
                    .unwrap()
            } else {
                wire
            };
            assert_eq!(bob.decrypt(&wire).unwrap(), text.as_bytes());

            let text = format!("bob round {round}");
            let (_, wire) = bob.encrypt(&bob_identity, text.as_bytes()).unwrap();
            assert_eq!(alice.decrypt(&wire).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let (mut alice, mut bob, alice_identity, bob_identity) = establish();

        // settle the session
        let (_, reply) = bob.encrypt(&bob_identity, b"ack").unwrap();
        alice.decrypt(&reply).unwrap();

        let (_, first) = alice.encrypt(&alice_identity, b"one").unwrap();
        let (_, second) = alice.encrypt(&alice_identity, b"two").unwrap();
        let (_, third) = alice.encrypt(&alice_identity, b"three").unwrap();

        assert_eq!(bob.decrypt(&third).unwrap(), b"three");
        assert_eq!(bob.decrypt(&first).unwrap(), b"one");
        assert_eq!(bob.decrypt(&second).unwrap(), b"two");
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut alice, mut bob, alice_identity, bob_identity) = establish();
        let (_, reply) = bob.encrypt(&bob_identity, b"ack").unwrap();
        alice.decrypt(&reply).unwrap();

        let (_, wire) = alice.encrypt(&alice_identity, b"once only").unwrap();
        assert_eq!(bob.decrypt(&wire).unwrap(), b"once only");
        assert!(bob.decrypt(&wire).is_err());
    }

    #[test]
    fn test_bad_bundle_signature_rejected() {
        let alice_identity = IdentityKeyPair::generate();
        let bob = Party::new();
        let mut bundle = bob.bundle();
        bundle.signed_pre_key_signature[0] ^= 0x01;
        assert!(Session::initiate(&alice_identity, 111, &bundle).is_err());
    }

    #[test]
    fn test_record_roundtrips_through_bytes() {
        let (alice, _, _, _) = establish();
        let bytes = alice.to_bytes();
        let back = Session::from_bytes(&bytes).unwrap();
        assert_eq!(back, alice);
    }
}
