//! Authentication logic.
//!
//! Provides password hashing, PIN matching, token issuing/verification, and
//! the ordered user-resolution strategies shared by `marquee_api` and the agent.

pub mod jwt;
pub mod password;
pub mod pin;
pub mod resolver;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::StoreError;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token missing")]
    TokenMissing,

    #[error("Token malformed")]
    TokenMalformed,

    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    #[error("Session invalidated")]
    SessionInvalidated,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Theater inactive")]
    TheaterInactive,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// SHA-256 hash a token for storage.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_token_is_stable_hex() {
        let a = hash_token("abc");
        assert_eq!(a, hash_token("abc"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_token("abd"));
    }
}
