//! Session tokens.
//!
//! Tokens are opaque `tk_`-prefixed random strings stored with an owner and an
//! expiry. A user may hold any number of them at once (one per device).
//! Expired rows stay in the store until [`TokenManager::remove_expired`] runs,
//! but are rejected exactly like missing ones.

use super::error::{AuthError, Result};
use super::store::IdentityStore;
use super::types::{Token, User, EVERYONE};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;

/// Prefix of every token value.
pub const TOKEN_PREFIX: &str = "tk_";

/// Total token length, prefix included.
pub const TOKEN_LENGTH: usize = 32;

/// Default validity window: 72 hours (seconds).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 72 * 3600;

/// Attempts at finding an unused value before giving up.
const MAX_GENERATE_ATTEMPTS: usize = 8;

/// Issues, validates, extends and sweeps session tokens.
pub struct TokenManager {
    store: Arc<IdentityStore>,
    ttl_secs: i64,
}

impl TokenManager {
    pub fn new(store: Arc<IdentityStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Issue a new token for `user`.
    pub fn create(&self, user: &User) -> Result<Token> {
        if user.name == EVERYONE {
            return Err(AuthError::invalid("the anonymous identity cannot hold tokens"));
        }
        let expires = self.expiry_from_now();

        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let value = generate_token();
            if self.store.insert_token(&value, &user.name, expires.timestamp())? {
                tracing::debug!(user = %user.name, "Token created");
                return Ok(Token { value, expires });
            }
        }
        Err(AuthError::Conflict("could not generate a unique token".into()))
    }

    /// Resolve a token to its owner. Malformed, unknown and expired tokens are
    /// all `Unauthenticated`.
    pub fn authenticate(&self, value: &str) -> Result<User> {
        if !is_well_formed(value) {
            return Err(AuthError::Unauthenticated);
        }
        let now = Utc::now().timestamp();
        let owner = self
            .store
            .token_owner(value, now)?
            .ok_or(AuthError::Unauthenticated)?;
        let mut user = self.store.user(&owner)?.ok_or(AuthError::Unauthenticated)?;
        user.token = Some(value.to_string());
        Ok(user)
    }

    /// Push the expiry of the user's current token to now + TTL. The value
    /// does not change.
    pub fn extend(&self, user: &User) -> Result<Token> {
        let value = user.token.as_deref().ok_or(AuthError::NoTokenProvided)?;
        let expires = self.expiry_from_now();
        if !self
            .store
            .update_token_expiry(value, &user.name, expires.timestamp())?
        {
            return Err(AuthError::Unauthenticated);
        }
        Ok(Token {
            value: value.to_string(),
            expires,
        })
    }

    /// Delete the user's current token. Already-deleted tokens are fine.
    pub fn remove(&self, user: &User) -> Result<()> {
        let value = user.token.as_deref().ok_or(AuthError::NoTokenProvided)?;
        self.store.delete_token(value)?;
        Ok(())
    }

    /// Delete every token that has expired. Returns how many were removed.
    pub fn remove_expired(&self) -> Result<usize> {
        let removed = self.store.delete_expired_tokens(Utc::now().timestamp())?;
        if removed > 0 {
            tracing::info!(removed, "Removed expired tokens");
        }
        Ok(removed)
    }

    fn expiry_from_now(&self) -> DateTime<Utc> {
        // Whole seconds, matching what the store keeps.
        let expires = Utc::now().timestamp().saturating_add(self.ttl_secs);
        DateTime::from_timestamp(expires, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Generate a random token value.
fn generate_token() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH - TOKEN_PREFIX.len())
        .map(char::from)
        .collect();
    format!("{TOKEN_PREFIX}{random}")
}

fn is_well_formed(value: &str) -> bool {
    value.len() == TOKEN_LENGTH
        && value.starts_with(TOKEN_PREFIX)
        && value[TOKEN_PREFIX.len()..].bytes().all(|b| b.is_ascii_alphanumeric())
}
