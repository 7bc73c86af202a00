//! Curve25519 key material for the noise transport and the signal layer.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// A Curve25519 key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key (32 bytes)
    pub public: [u8; 32],
    /// Private key (32 bytes)
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);

        // Curve25519 scalar clamping
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Perform X25519 Diffie-Hellman key agreement.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let their_key = PublicKey::from(*their_public);
        *secret.diffie_hellman(&their_key).as_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// The account identity key pair.
///
/// A single 32-byte seed backs both an Ed25519 signing key (signed-prekey
/// signatures, device identity) and an X25519 scalar (X3DH agreement). The
/// public form on the wire is the Ed25519 verifying key; peers derive the
/// Montgomery point from it for DH.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    seed: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self { seed }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    fn signing_key(&self) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&self.seed)
    }

    /// Public identity key as sent in prekey bundles and device identity.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key().verifying_key().to_bytes()
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.signing_key().sign(message).to_bytes()
    }

    /// X25519 agreement between our identity scalar and a peer Ed25519 key.
    pub fn dh(&self, their_identity: &[u8; 32]) -> Result<[u8; 32], &'static str> {
        let scalar = self.signing_key().to_scalar_bytes();
        let montgomery = montgomery_from_edwards(their_identity)?;
        Ok(x25519_dalek::x25519(scalar, montgomery))
    }

    /// X25519 agreement between our identity scalar and a raw X25519 key.
    pub fn dh_with_public(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let scalar = self.signing_key().to_scalar_bytes();
        x25519_dalek::x25519(scalar, *their_public)
    }
}

/// Montgomery (X25519) form of an Ed25519 verifying key.
pub fn montgomery_from_edwards(edwards: &[u8; 32]) -> Result<[u8; 32], &'static str> {
    let vk = ed25519_dalek::VerifyingKey::from_bytes(edwards).map_err(|_| "invalid identity key")?;
    Ok(vk.to_montgomery().to_bytes())
}

/// X25519 agreement between a plain pair and a peer Ed25519 identity key.
pub fn dh_with_identity(pair: &KeyPair, their_identity: &[u8; 32]) -> Result<[u8; 32], &'static str> {
    let montgomery = montgomery_from_edwards(their_identity)?;
    Ok(x25519_dalek::x25519(pair.private, montgomery))
}

/// Verify an identity-key signature.
pub fn verify_identity_signature(
    identity: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> bool {
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(identity) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    vk.verify_strict(message, &sig).is_ok()
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish()
    }
}

/// A pre-key: an X25519 pair with an id, optionally signed by the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    pub signature: Option<Vec<u8>>,
}

impl PreKey {
    /// Generate a new unsigned pre-key.
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key_id,
            signature: None,
        }
    }

    /// Generate a signed pre-key. The signed payload is the DJB-type-prefixed
    /// public key, matching what `verify_prekey_signature` checks.
    pub fn new_signed(key_id: u32, identity: &IdentityKeyPair) -> Self {
        let mut pre_key = Self::new(key_id);
        pre_key.signature = Some(identity.sign(&signed_prekey_payload(&pre_key.key_pair.public)).to_vec());
        pre_key
    }
}

/// The byte string an identity signs for a signed pre-key.
pub fn signed_prekey_payload(public: &[u8; 32]) -> [u8; 33] {
    let mut message = [0u8; 33];
    message[0] = 0x05;
    message[1..].copy_from_slice(public);
    message
}

/// Check a signed pre-key against the owner identity.
pub fn verify_prekey_signature(identity: &[u8; 32], prekey_pub: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(sig) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    verify_identity_signature(identity, &signed_prekey_payload(prekey_pub), &sig)
}
