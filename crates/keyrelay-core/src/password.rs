use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::Rng;
use sha2::{Digest, Sha256};

use keyrelay_common::PasswordCost;

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("invalid argon2 parameters: {0}")]
    Params(argon2::Error),
    #[error("password hashing failed: {0}")]
    Hash(argon2::password_hash::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    /// Matched an unsalted SHA-256 digest; the caller should store a fresh hash.
    MatchLegacy,
    Mismatch,
}

impl Verification {
    pub fn is_match(&self) -> bool {
        !matches!(self, Verification::Mismatch)
    }
}

/// Salted Argon2id hashing for the admin password.
#[derive(Clone)]
pub struct PasswordHashing {
    argon: Argon2<'static>,
}

impl PasswordHashing {
    pub fn new(cost: PasswordCost) -> Result<Self, PasswordError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(PasswordError::Params)?;
        Ok(Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// PHC string, e.g. `$argon2id$v=19$m=19456,t=2,p=1$...`.
    pub fn hash(&self, plain: &str) -> Result<String, PasswordError> {
        let mut salt_bytes = [0u8; 16];
        rand::rng().fill(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes).map_err(PasswordError::Hash)?;
        let hash = self
            .argon
            .hash_password(plain.as_bytes(), &salt)
            .map_err(PasswordError::Hash)?;
        Ok(hash.to_string())
    }

    pub fn verify(&self, plain: &str, stored: &str) -> Verification {
        let stored = stored.trim();
        if is_legacy_digest(stored) {
            let digest = format!("{:x}", Sha256::digest(plain.as_bytes()));
            return if constant_time_eq(digest.as_bytes(), stored.to_ascii_lowercase().as_bytes())
            {
                Verification::MatchLegacy
            } else {
                Verification::Mismatch
            };
        }
        let Ok(parsed) = PasswordHash::new(stored) else {
            return Verification::Mismatch;
        };
        // Parameters come from the stored string, so older cost settings still verify.
        if self
            .argon
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok()
        {
            Verification::Match
        } else {
            Verification::Mismatch
        }
    }
}

pub fn is_acceptable_password(plain: &str) -> bool {
    plain.chars().count() >= MIN_PASSWORD_LEN
}

fn is_legacy_digest(stored: &str) -> bool {
    stored.len() == 64 && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashing() -> PasswordHashing {
        PasswordHashing::new(PasswordCost {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn hash_is_salted_and_verifies() {
        let h = hashing();
        let a = h.hash("correct horse").unwrap();
        let b = h.hash("correct horse").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$argon2id$"));
        assert_eq!(h.verify("correct horse", &a), Verification::Match);
        assert_eq!(h.verify("wrong horse", &a), Verification::Mismatch);
    }

    #[test]
    fn legacy_sha256_digest_is_recognised() {
        let h = hashing();
        // sha256("password")
        let legacy = "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8";
        assert_eq!(h.verify("password", legacy), Verification::MatchLegacy);
        assert_eq!(
            h.verify("password", &legacy.to_ascii_uppercase()),
            Verification::MatchLegacy
        );
        assert_eq!(h.verify("passw0rd", legacy), Verification::Mismatch);
    }

    #[test]
    fn garbage_hash_never_matches() {
        assert_eq!(hashing().verify("anything", "not-a-hash"), Verification::Mismatch);
        assert_eq!(hashing().verify("", ""), Verification::Mismatch);
    }

    #[test]
    fn minimum_length_counts_chars() {
        assert!(!is_acceptable_password("1234567"));
        assert!(is_acceptable_password("12345678"));
        assert!(is_acceptable_password("密码密码密码密码"));
    }
}
