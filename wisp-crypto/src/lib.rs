#![forbid(unsafe_code)]

//! Wisp cryptography primitives (unsafe-forbid, pure Rust).
//! - KDF: PBKDF2-HMAC-SHA256 over the shared network secret, fixed salt
//! - Envelope: AES-256-GCM with a random 96-bit nonce prepended to the
//!   ciphertext, so every datagram is a self-contained token
//!
//! Anything on the socket that does not authenticate under the derived
//! key is not mesh traffic; callers treat [`Error::AuthenticationFailed`]
//! as "drop silently".

pub mod envelope;
pub mod kdf;

pub use envelope::Envelope;

/// Crypto error domain.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Tag mismatch, truncation, or tampering. Carries no detail on
    /// purpose: the datagram is simply not for us.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// RNG or cipher failure on the sealing path.
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Crate-local result alias.
pub type Result<T> = core::result::Result<T, Error>;
