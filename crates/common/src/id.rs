//! ID and token generation utilities.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Random bytes in a poll ID (128 bits).
pub const POLL_ID_BYTES: usize = 16;

/// Random bytes in session identifiers and creator tokens (256 bits).
pub const TOKEN_BYTES: usize = 32;

static POLL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9_-]{8,32}$").expect("valid poll id pattern")
});

/// ID generator for entities.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID for options and ledger records.
    ///
    /// ULIDs are lexicographically sortable and shorter than UUIDs when
    /// represented as strings.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a poll ID.
    ///
    /// Poll IDs carry 128 bits of randomness and double as the access
    /// capability for unlisted polls, so they must never be time-ordered.
    #[must_use]
    pub fn generate_poll_id(&self) -> String {
        random_url_safe(POLL_ID_BYTES)
    }

    /// Generate an ephemeral browser session identifier.
    #[must_use]
    pub fn generate_session_id(&self) -> String {
        random_url_safe(TOKEN_BYTES)
    }

    /// Generate a creator token, handed to the poll creator exactly once.
    #[must_use]
    pub fn generate_creator_token(&self) -> String {
        random_url_safe(TOKEN_BYTES)
    }
}

fn random_url_safe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check a poll ID against the accepted format before any lookup.
#[must_use]
pub fn is_valid_poll_id(poll_id: &str) -> bool {
    POLL_ID_PATTERN.is_match(poll_id)
}

/// SHA-256 hex digest of a bearer token, for storage and comparison.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_generate_poll_id() {
        let id_gen = IdGenerator::new();
        let id = id_gen.generate_poll_id();

        // 16 bytes -> 22 unpadded base64 characters
        assert_eq!(id.len(), 22);
        assert!(is_valid_poll_id(&id));
        assert_ne!(id, id_gen.generate_poll_id());
    }

    #[test]
    fn test_generate_tokens() {
        let id_gen = IdGenerator::new();
        assert_eq!(id_gen.generate_session_id().len(), 43);
        assert_eq!(id_gen.generate_creator_token().len(), 43);
    }

    #[test]
    fn test_poll_id_validation() {
        assert!(is_valid_poll_id("abcdEFGH_-12"));
        assert!(!is_valid_poll_id("short"));
        assert!(!is_valid_poll_id("../../etc/passwd"));
        assert!(!is_valid_poll_id("a'; DROP TABLE poll; --"));
        assert!(!is_valid_poll_id(&"a".repeat(33)));
    }

    #[test]
    fn test_hash_token() {
        let hash = hash_token("creator-token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("creator-token"));
        assert_ne!(hash, hash_token("other-token"));
    }
}
