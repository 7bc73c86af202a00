//! HKDF-SHA256 key derivation.
//!
//! Used by the noise handshake (chaining key mixing, transport split) and
//! by the signal layer (root/chain key ratcheting, message keys).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256: extract once, expand on demand.
pub struct Hkdf {
    prk: [u8; 32],
}

impl Hkdf {
    /// HKDF-Extract. A missing salt is a zeroed block, per RFC 5869.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let zeroes = [0u8; 32];
        let salt = salt.unwrap_or(&zeroes);
        let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key size");
        mac.update(ikm);
        let prk: [u8; 32] = mac.finalize().into_bytes().into();

        Self { prk }
    }

    /// HKDF-Expand into `out`.
    pub fn expand_into(&self, info: &[u8], out: &mut [u8]) {
        let mut t: Vec<u8> = Vec::new();
        let mut counter = 1u8;
        let mut written = 0usize;

        while written < out.len() {
            let mut mac = HmacSha256::new_from_slice(&self.prk).expect("HMAC accepts any key size");
            mac.update(&t);
            mac.update(info);
            mac.update(&[counter]);
            t = mac.finalize().into_bytes().to_vec();

            let take = (out.len() - written).min(t.len());
            out[written..written + take].copy_from_slice(&t[..take]);
            written += take;
            counter += 1;
        }
    }

    /// HKDF-Expand to a fresh buffer.
    pub fn expand(&self, info: &[u8], length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        self.expand_into(info, &mut out);
        out
    }

    /// Extract and expand in one call.
    pub fn derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
        Self::new(salt, ikm).expand(info, length)
    }
}

/// Split 64 bytes of derived material into two 32-byte keys.
pub fn derive_key_pair(salt: &[u8], ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let derived = Hkdf::derive(Some(salt), ikm, info, 64);
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&derived[0..32]);
    second.copy_from_slice(&derived[32..64]);
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc5869_test_case_1() {
        // RFC 5869 A.1
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        let okm = Hkdf::derive(Some(&salt), &ikm, &info, 42);
        assert_eq!(
            hex::encode(&okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_no_salt_matches_zero_salt() {
        let ikm = b"input key material";
        let zeroes = [0u8; 32];
        assert_eq!(
            Hkdf::derive(None, ikm, b"info", 32),
            Hkdf::derive(Some(&zeroes), ikm, b"info", 32)
        );
    }

    #[test]
    fn test_derive_key_pair_differs() {
        let (k1, k2) = derive_key_pair(&[0xcd; 32], &[0xab; 32], b"");
        assert_ne!(k1, k2);
        assert_ne!(k1, [0u8; 32]);
    }
}
