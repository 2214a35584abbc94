//! Anonymous voter identity.
//!
//! A voter is identified per poll by a one-way token derived from the
//! ephemeral browser session identifier and the poll ID. Nothing else about
//! the voter is stored, so the one-vote guarantee holds per browser session,
//! not per person: clearing the session cookie yields a fresh identity.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted session identifier length.
pub const MIN_SESSION_ID_LEN: usize = 16;

const TOKEN_CONTEXT: &[u8] = b"pollivu.voter-token.v1:";

/// An ephemeral session identifier assigned by the transport layer.
///
/// It is never persisted; only [`VoterToken`]s derived from it are.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a session identifier, rejecting empty or short values.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.len() < MIN_SESSION_ID_LEN {
            return Err(AppError::BadRequest("Missing voter session".to_string()));
        }
        Ok(Self(value))
    }

    /// The raw identifier, for writing back into the session cookie.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionId(<redacted>)")
    }
}

/// Per-poll voter token, the sole identity artifact in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoterToken(String);

impl VoterToken {
    /// Derive the token for `session` voting on `poll_id`.
    ///
    /// Deterministic for the same pair; tokens for different polls are
    /// unlinkable without the session identifier, which keys the MAC.
    #[must_use]
    pub fn derive(session: &SessionId, poll_id: &str) -> Self {
        #[allow(clippy::expect_used)]
        let mut mac = HmacSha256::new_from_slice(session.0.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(TOKEN_CONTEXT);
        mac.update(poll_id.as_bytes());
        Self(hex::encode(mac.finalize().into_bytes()))
    }

    /// Rebuild a token read back from storage.
    #[must_use]
    pub const fn from_stored(value: String) -> Self {
        Self(value)
    }

    /// Hex form as stored in the ledger.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log correlation.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}
