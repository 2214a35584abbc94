//! Request extractors.

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::request::Parts,
};
use pollivu_common::{AppError, SessionId};

/// Header carrying the creator token on management requests.
pub const CREATOR_TOKEN_HEADER: &str = "x-creator-token";

/// Voter session extractor.
#[derive(Debug, Clone)]
pub struct VoterSession(pub SessionId);

impl<S> FromRequestParts<S> for VoterSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Set by the session middleware
        parts
            .extensions
            .get::<SessionId>()
            .cloned()
            .map(VoterSession)
            .ok_or_else(|| AppError::BadRequest("Missing voter session".to_string()))
    }
}

/// Creator token extractor.
#[derive(Clone)]
pub struct CreatorToken(pub String);

impl std::fmt::Debug for CreatorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CreatorToken(<redacted>)")
    }
}

impl CreatorToken {
    fn from_headers(parts: &Parts) -> Option<Self> {
        parts
            .headers
            .get(CREATOR_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_string()))
    }
}

impl<S> FromRequestParts<S> for CreatorToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_headers(parts)
            .ok_or_else(|| AppError::Forbidden("Missing creator token".to_string()))
    }
}

/// Read endpoints accept the token when present.
impl<S> OptionalFromRequestParts<S> for CreatorToken
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(Self::from_headers(parts))
    }
}
