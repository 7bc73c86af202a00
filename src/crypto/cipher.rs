//! AES-256-GCM primitives.
//!
//! [`FrameCipher`] carries one transport direction after the noise
//! handshake: a fixed key and a 64-bit counter used as the nonce,
//! incremented on every frame. The free functions serve the signal layer,
//! which derives a fresh key and nonce per message.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// One direction of the post-handshake transport channel.
pub struct FrameCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl FrameCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("32-byte key"),
            counter: 0,
        }
    }

    /// Nonce for the current counter: 4 zero bytes then the counter BE.
    fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..12].copy_from_slice(&self.counter.to_be_bytes());
        nonce
    }

    /// Encrypt the next frame, consuming one counter value.
    pub fn encrypt_next(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.nonce();
        let out = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::EncryptionFailed)?;
        self.counter += 1;
        Ok(out)
    }

    /// Decrypt the next frame, consuming one counter value.
    ///
    /// The counter is consumed even on failure; the transport treats any
    /// failure as fatal, so the channel never recovers from a gap.
    pub fn decrypt_next(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.nonce();
        self.counter += 1;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CipherError::DecryptionFailed)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// One-shot AEAD encryption with explicit nonce and associated data.
pub fn aead_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CipherError::EncryptionFailed)
}

/// One-shot AEAD decryption with explicit nonce and associated data.
pub fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CipherError::DecryptionFailed)
}
