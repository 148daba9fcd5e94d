//! Password challenge state

use bytes::Bytes;

use pt_core::auth::{
    generate_challenge, random_bytes, salted_password, verify_digest, CHALLENGE_BYTES,
    DIGEST_BYTES,
};
use pt_protocol::AuthChallenge;

/// Holds the salted password for the lifetime of the agent.
///
/// The salt is drawn once at start; every login gets a fresh challenge.
pub struct PasswordGate {
    salt: Bytes,
    salted: Option<[u8; DIGEST_BYTES]>,
}

impl PasswordGate {
    pub fn new(password: Option<&str>) -> Self {
        let salt = random_bytes(CHALLENGE_BYTES);
        let salted = password.map(|password| salted_password(password, &salt));
        Self { salt, salted }
    }

    /// Whether clients must answer a challenge
    pub fn requires_password(&self) -> bool {
        self.salted.is_some()
    }

    /// New challenge for one login attempt
    pub fn challenge(&self) -> AuthChallenge {
        AuthChallenge {
            salt: self.salt.clone(),
            challenge: generate_challenge(),
        }
    }

    /// Check a submitted digest against `challenge`
    pub fn verify(&self, challenge: &[u8], digest: &[u8]) -> bool {
        match &self.salted {
            Some(salted) => verify_digest(salted, challenge, digest),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_core::auth::password_digest;

    #[test]
    fn test_open_gate_accepts_anything() {
        let gate = PasswordGate::new(None);
        assert!(!gate.requires_password());
        assert!(gate.verify(b"c", b""));
    }

    #[test]
    fn test_digest_checked_against_challenge() {
        let gate = PasswordGate::new(Some("pw"));
        let first = gate.challenge();
        let second = gate.challenge();
        assert_eq!(first.salt, second.salt);
        assert_ne!(first.challenge, second.challenge);

        let digest = password_digest("pw", &first.salt, &first.challenge);
        assert!(gate.verify(&first.challenge, &digest));
        assert!(!gate.verify(&second.challenge, &digest));

        let wrong = password_digest("nope", &first.salt, &first.challenge);
        assert!(!gate.verify(&first.challenge, &wrong));
    }
}
