//! Cryptographic primitives: key pairs, HKDF, AEAD ciphers and the noise
//! handshake state.

pub mod cipher;
pub mod hkdf;
pub mod keypair;
pub mod noise;

pub use cipher::{aead_decrypt, aead_encrypt, CipherError, FrameCipher};
pub use hkdf::{derive_key_pair, Hkdf};
pub use keypair::{
    dh_with_identity, montgomery_from_edwards, signed_prekey_payload, verify_identity_signature,
    verify_prekey_signature, IdentityKeyPair, KeyPair, PreKey,
};
pub use noise::{NoiseError, NoiseHandshake, Role, NOISE_PROTOCOL_NAME};
