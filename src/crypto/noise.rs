//! Noise_XX_25519_AESGCM_SHA256 handshake state.
//!
//! Symmetric-state primitives shared by both roles; the message-level
//! flow (client hello / server hello / client finish) lives in the socket
//! module. The responder role exists so both ends of the handshake can be
//! exercised in-process.

use crate::crypto::cipher::CipherError;
use crate::crypto::hkdf::derive_key_pair;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Noise pattern name, padded to exactly 32 bytes.
pub const NOISE_PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

/// Which side of the handshake this state drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NoiseError {
    #[error("handshake message too short")]
    MessageTooShort,
    #[error("handshake decryption failed")]
    DecryptionFailed,
    #[error("handshake encryption failed")]
    EncryptionFailed,
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("missing remote key")]
    MissingRemoteKey,
}

impl From<CipherError> for NoiseError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::DecryptionFailed => NoiseError::DecryptionFailed,
            _ => NoiseError::EncryptionFailed,
        }
    }
}

/// Symmetric handshake state: running hash, chaining salt, current key.
pub struct NoiseHandshake {
    hash: [u8; 32],
    salt: [u8; 32],
    key: [u8; 32],
    counter: u32,
    role: Role,
}

impl NoiseHandshake {
    /// Start a handshake; the prologue (WA header plus any routing info)
    /// is authenticated immediately.
    pub fn new(role: Role, prologue: &[u8]) -> Self {
        let hash: [u8; 32] = *NOISE_PROTOCOL_NAME;
        let mut state = Self {
            hash,
            salt: hash,
            key: hash,
            counter: 0,
            role,
        };
        state.authenticate(prologue);
        state
    }

    /// Mix data into the running hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    /// Mix a DH result into the chaining key; resets the nonce counter.
    pub fn mix_into_key(&mut self, shared_secret: &[u8; 32]) {
        self.counter = 0;
        let (salt, key) = derive_key_pair(&self.salt, shared_secret, b"");
        self.salt = salt;
        self.key = key;
    }

    fn nonce(&self) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[8..12].copy_from_slice(&self.counter.to_be_bytes());
        iv
    }

    /// Encrypt with the current key, authenticating the running hash.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| NoiseError::EncryptionFailed)?;
        let nonce = self.nonce();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &self.hash })
            .map_err(|_| NoiseError::EncryptionFailed)?;

        self.counter += 1;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt with the current key, authenticating the running hash.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| NoiseError::EncryptionFailed)?;
        let nonce = self.nonce();
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &self.hash })
            .map_err(|_| NoiseError::DecryptionFailed)?;

        self.counter += 1;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Split into `(write_key, read_key)` for this role's transport channel.
    pub fn finish(self) -> ([u8; 32], [u8; 32]) {
        let (k1, k2) = derive_key_pair(&self.salt, &[], b"");
        match self.role {
            Role::Initiator => (k1, k2),
            Role::Responder => (k2, k1),
        }
    }
}
