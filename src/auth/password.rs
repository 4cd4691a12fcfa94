//! bcrypt password hashing.

use anyhow::{Context, Result};
use std::sync::OnceLock;

/// Work factor for new hashes. Tests use the bcrypt minimum to stay fast.
#[cfg(not(test))]
const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const BCRYPT_COST: u32 = 4;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Hash compared against when the account being authenticated does not
/// exist, so unknown emails cost the same as wrong passwords.
static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, BCRYPT_COST).context("Failed to hash password")
}

/// Check `password` against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    bcrypt::verify(password, hashed).unwrap_or(false)
}

/// Burn roughly one verification worth of time without a real hash.
pub fn dummy_verify(password: &str) {
    let hash = DUMMY_HASH.get_or_init(|| bcrypt::hash("quotakeeper-dummy", BCRYPT_COST).ok());
    if let Some(hash) = hash {
        let _ = bcrypt::verify(password, hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
    }

    #[test]
    fn same_password_gets_distinct_salts() {
        let a = hash_password("password123").unwrap();
        let b = hash_password("password123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_hash_does_not_verify() {
        assert!(!verify_password("anything", "not-a-bcrypt-hash"));
    }

    #[test]
    fn dummy_verify_does_not_panic() {
        dummy_verify("whatever");
    }
}
