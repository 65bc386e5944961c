//! Host key hashing using Argon2id
//!
//! Partner hosts authenticate with a shared key. Only the Argon2id hash is
//! stored.
//!
//! # Fast Mode
//!
//! When `fast: true` is passed to `hash_key`, it produces `$FAST$<key>`,
//! which `verify_key` detects and compares directly. Test suites use it to
//! skip Argon2's intentional slowness.
//!
//! **Never use fast mode in production** - it stores keys in plaintext.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

/// Prefix for fast (test-only) key hashes
const FAST_HASH_PREFIX: &str = "$FAST$";

/// Longest key accepted, in bytes
pub const MAX_HOST_KEY_LENGTH: usize = 256;

/// Errors hashing or verifying a host key
#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("host key is empty")]
    Empty,

    #[error("host key is longer than {MAX_HOST_KEY_LENGTH} bytes")]
    TooLong,

    #[error("{0}")]
    Hash(argon2::password_hash::Error),
}

impl From<argon2::password_hash::Error> for HostKeyError {
    fn from(err: argon2::password_hash::Error) -> Self {
        HostKeyError::Hash(err)
    }
}

fn validate_key(key: &str) -> Result<(), HostKeyError> {
    if key.is_empty() {
        return Err(HostKeyError::Empty);
    }
    if key.len() > MAX_HOST_KEY_LENGTH {
        return Err(HostKeyError::TooLong);
    }
    Ok(())
}

/// Hash a host key
///
/// Returns `$FAST$<key>` in fast mode, otherwise an Argon2id hash in PHC
/// string format.
pub fn hash_key(key: &str, fast: bool) -> Result<String, HostKeyError> {
    validate_key(key)?;

    if fast {
        Ok(format!("{}{}", FAST_HASH_PREFIX, key))
    } else {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(key.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }
}

/// Verify a key against a stored hash
///
/// An empty or oversized key never matches. Argon2 verification compares in
/// constant time; fast hashes do not, but only exist in tests.
pub fn verify_key(key: &str, key_hash: &str) -> Result<bool, HostKeyError> {
    if validate_key(key).is_err() {
        return Ok(false);
    }

    // Fast hash - direct comparison (test mode only)
    if let Some(stored) = key_hash.strip_prefix(FAST_HASH_PREFIX) {
        return Ok(stored == key);
    }

    let parsed = PasswordHash::new(key_hash)?;
    match Argon2::default().verify_password(key.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(HostKeyError::Hash(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argon2_hash_and_verify() {
        let hash = hash_key("partner-secret", false).unwrap();
        assert!(hash.starts_with("$argon2"));

        assert!(verify_key("partner-secret", &hash).unwrap());
        assert!(!verify_key("wrong-secret", &hash).unwrap());
    }

    #[test]
    fn test_fast_hash_and_verify() {
        let hash = hash_key("partner-secret", true).unwrap();
        assert_eq!(hash, "$FAST$partner-secret");

        assert!(verify_key("partner-secret", &hash).unwrap());
        assert!(!verify_key("wrong-secret", &hash).unwrap());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(hash_key("", true), Err(HostKeyError::Empty)));
        let long = "k".repeat(MAX_HOST_KEY_LENGTH + 1);
        assert!(matches!(hash_key(&long, true), Err(HostKeyError::TooLong)));

        // Never matches, even against a hash of the same text
        assert!(!verify_key("", "$FAST$").unwrap());
    }

    #[test]
    fn test_malformed_hash() {
        assert!(matches!(
            verify_key("partner-secret", "not-a-hash"),
            Err(HostKeyError::Hash(_))
        ));
    }
}
