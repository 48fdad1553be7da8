//! Network-secret key derivation.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Fixed ASCII salt shared by every node; the secret is the only input
/// that distinguishes networks.
const SALT: &[u8] = b"p2p_mesh_network";

const ITERATIONS: u32 = 100_000;

/// Derive the 256-bit datagram key from the shared network secret.
///
/// Deterministic: every node holding the same secret derives the same
/// key, which is what makes decryption double as authentication.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), SALT, ITERATIONS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(derive_key("secret"), derive_key("secret"));
    }

    #[test]
    fn distinct_secrets_yield_distinct_keys() {
        assert_ne!(derive_key("secret"), derive_key("other"));
    }
}
