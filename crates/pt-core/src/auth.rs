//! Challenge/digest login helpers
//!
//! The target stores `SHA-256(password || salt)` and issues a fresh challenge
//! per login. The client proves knowledge of the password by sending
//! `SHA-256(SHA-256(password || salt) || challenge)`; the plaintext never
//! crosses the wire.

use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of generated salts and challenges in bytes
pub const CHALLENGE_BYTES: usize = 32;

/// Length of a digest in bytes
pub const DIGEST_BYTES: usize = 32;

/// `SHA-256(password || salt)`
pub fn salted_password(password: &str, salt: &[u8]) -> [u8; DIGEST_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.finalize().into()
}

/// `SHA-256(salted || challenge)`
pub fn challenge_digest(salted: &[u8], challenge: &[u8]) -> [u8; DIGEST_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(salted);
    hasher.update(challenge);
    hasher.finalize().into()
}

/// Full client-side digest for a password, salt and challenge
pub fn password_digest(password: &str, salt: &[u8], challenge: &[u8]) -> [u8; DIGEST_BYTES] {
    challenge_digest(&salted_password(password, salt), challenge)
}

/// Check a submitted digest against the stored salted password.
///
/// Comparison is constant-time over the digest length.
pub fn verify_digest(salted: &[u8], challenge: &[u8], submitted: &[u8]) -> bool {
    let expected = challenge_digest(salted, challenge);
    if submitted.len() != expected.len() {
        return false;
    }

    let mut result = 0u8;
    for (a, b) in submitted.iter().zip(expected.iter()) {
        result |= a ^ b;
    }
    result == 0
}

/// Random bytes from the thread-local CSPRNG
pub fn random_bytes(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Fresh challenge for one login attempt
pub fn generate_challenge() -> Bytes {
    random_bytes(CHALLENGE_BYTES)
}
