//! Password hashing with a tunable cost and timing-uniform verification.
//!
//! Hashes are PBKDF2-HMAC-SHA256 in PHC string form
//! (`$pbkdf2-sha256$i=<rounds>,l=32$<salt>$<hash>`), so the round count travels
//! with each hash and can be raised later without invalidating old ones.
//!
//! Stores migrated from the legacy layout still hold bcrypt hashes
//! (`$2a$`, `$2b$`, `$2y$`). Those verify as-is and are reported by
//! [`CredentialHasher::needs_rehash`] so the caller can replace them after a
//! successful login.

use super::error::Result;
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::{Params, Pbkdf2};
use rand::RngCore;

/// Default PBKDF2 round count.
pub const DEFAULT_HASH_ROUNDS: u32 = 100_000;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Derived key length in bytes.
const OUTPUT_BYTES: usize = 32;

/// Prefixes of bcrypt hashes carried over from legacy stores.
const BCRYPT_PREFIXES: [&str; 3] = ["$2a$", "$2b$", "$2y$"];

/// Input for the dummy hash. Its value is irrelevant; only its cost matters.
const DUMMY_PASSWORD: &str = "topicgate-dummy-password";

/// Hashes passwords and verifies them in constant-ish time.
///
/// Holds a dummy hash computed with the configured cost at construction, so a
/// lookup for an unknown user burns the same CPU as a real verification.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    rounds: u32,
    dummy_hash: String,
}

impl CredentialHasher {
    pub fn new(rounds: u32) -> Result<Self> {
        let dummy_hash = hash_password(DUMMY_PASSWORD, rounds)?;
        Ok(Self { rounds, dummy_hash })
    }

    /// Hash `password` with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String> {
        hash_password(password, self.rounds)
    }

    /// Verify `password` against `stored`, or against the dummy hash when there
    /// is no usable stored hash. Exactly one full verification runs on every
    /// path and the dummy result is discarded.
    pub fn verify(&self, password: &str, stored: Option<&str>) -> bool {
        let Some(stored) = stored.filter(|hash| !hash.is_empty()) else {
            // Unknown user or the anonymous identity.
            let _ = self.verify_dummy(password);
            return false;
        };

        if is_bcrypt(stored) {
            return bcrypt::verify(password, stored).unwrap_or(false);
        }

        match PasswordHash::new(stored) {
            Ok(hash) if hash.algorithm.as_str().starts_with("pbkdf2") => {
                Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok()
            }
            _ => {
                let _ = self.verify_dummy(password);
                false
            }
        }
    }

    /// True if `stored` is a legacy bcrypt hash or a PBKDF2 hash with a round
    /// count other than the configured one.
    pub fn needs_rehash(&self, stored: &str) -> bool {
        if is_bcrypt(stored) {
            return true;
        }
        PasswordHash::new(stored)
            .ok()
            .and_then(|hash| hash.params.get_decimal("i"))
            .is_some_and(|rounds| rounds != self.rounds)
    }

    fn verify_dummy(&self, password: &str) -> bool {
        PasswordHash::new(&self.dummy_hash)
            .map(|hash| Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok())
            .unwrap_or(false)
    }
}

fn is_bcrypt(stored: &str) -> bool {
    BCRYPT_PREFIXES.iter().any(|prefix| stored.starts_with(prefix))
}

/// Hash a password with a random salt and the given round count.
fn hash_password(password: &str, rounds: u32) -> Result<String> {
    let mut salt_bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)?;

    let params = Params {
        rounds,
        output_length: OUTPUT_BYTES,
    };
    let hash = Pbkdf2.hash_password_customized(password.as_bytes(), None, None, params, &salt)?;
    Ok(hash.to_string())
}
