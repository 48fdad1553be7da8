#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Authenticated envelope for overlay datagrams.
//!
//! Wire form: `nonce(12) ∥ ciphertext ∥ tag(16)`. Sealing is
//! non-deterministic; opening fails on any tampering, truncation, or a
//! key derived from a different secret.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use getrandom::getrandom;
use zeroize::Zeroize;

use crate::{kdf, Error, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric envelope keyed by the shared network secret.
///
/// The key is immutable after construction; the envelope is cheap to
/// share behind an `Arc` between the send and receive paths.
pub struct Envelope {
    cipher: Aes256Gcm,
}

impl Envelope {
    /// Derive the datagram key from `secret` and build the cipher.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = kdf::derive_key(secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        key.zeroize();
        Self { cipher }
    }

    /// Seal `plaintext` into a self-contained token.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom(&mut nonce)
            .map_err(|e| Error::Crypto(format!("nonce generation failed: {e}")))?;
        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Open a sealed token, authenticating it in the process.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::AuthenticationFailed);
        }
        let (nonce, ct) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| Error::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seal_open_roundtrip() {
        let env = Envelope::from_secret("secret");
        let sealed = env.seal(b"hello mesh").unwrap();
        assert_eq!(env.open(&sealed).unwrap(), b"hello mesh");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let env = Envelope::from_secret("secret");
        let sealed = env.seal(b"").unwrap();
        assert_eq!(env.open(&sealed).unwrap(), b"");
    }

    #[test]
    fn sealing_is_nondeterministic() {
        let env = Envelope::from_secret("secret");
        let a = env.seal(b"same input").unwrap();
        let b = env.seal(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn any_bit_flip_fails_authentication() {
        let env = Envelope::from_secret("secret");
        let sealed = env.seal(b"x").unwrap();
        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                assert!(env.open(&tampered).is_err(), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn truncation_fails_authentication() {
        let env = Envelope::from_secret("secret");
        let sealed = env.seal(b"payload").unwrap();
        for len in 0..sealed.len() {
            assert!(env.open(&sealed[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn wrong_secret_fails_authentication() {
        let sealed = Envelope::from_secret("secret").seal(b"m").unwrap();
        assert!(matches!(
            Envelope::from_secret("other").open(&sealed),
            Err(Error::AuthenticationFailed)
        ));
    }

    proptest! {
        #[test]
        fn roundtrip_random_input(m in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let env = Envelope::from_secret("secret");
            let sealed = env.seal(&m).unwrap();
            prop_assert_eq!(env.open(&sealed).unwrap(), m);
        }
    }
}
