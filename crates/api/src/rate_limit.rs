//! API rate limiting middleware.
//!
//! Fixed-window limits per client address. Session cookies are minted for
//! free, so they never key a budget.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use pollivu_common::config::RateLimitSettings;
use pollivu_common::{AppError, get_metrics};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Rate limit configuration for one endpoint category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Time window duration in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    /// Create a new rate limit config.
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    const fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, 60)
    }
}

/// Endpoint categories with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCategory {
    /// Snapshot polling and other reads.
    Snapshot,
    /// Vote casting.
    Vote,
    /// Poll creation and management.
    Write,
}

impl RateCategory {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Vote => "vote",
            Self::Write => "write",
        }
    }
}

/// Rate limit state for a single key.
#[derive(Debug, Clone)]
struct WindowState {
    count: u32,
    window_start: Instant,
}

impl WindowState {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }
}

/// Fixed-window rate limiter keyed by arbitrary strings.
#[derive(Clone, Default)]
pub struct ApiRateLimiter {
    states: Arc<RwLock<HashMap<String, WindowState>>>,
}

impl ApiRateLimiter {
    /// Create a new rate limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a request is allowed and record it.
    pub async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitResult {
        let mut states = self.states.write().await;
        let now = Instant::now();
        let window = Duration::from_secs(config.window_secs);

        let state = states
            .entry(key.to_string())
            .or_insert_with(|| WindowState::new(now));

        if now.duration_since(state.window_start) >= window {
            state.count = 0;
            state.window_start = now;
        }

        let reset = window
            .saturating_sub(now.duration_since(state.window_start))
            .as_secs()
            .max(1);

        if state.count >= config.max_requests {
            return RateLimitResult::Limited {
                retry_after: reset,
                limit: config.max_requests,
            };
        }

        state.count += 1;
        RateLimitResult::Allowed {
            remaining: config.max_requests.saturating_sub(state.count),
            limit: config.max_requests,
            reset,
        }
    }

    /// Drop keys whose window ended more than one window ago.
    pub async fn cleanup(&self, max_window_secs: u64) -> usize {
        let mut states = self.states.write().await;
        let now = Instant::now();
        let max_window = Duration::from_secs(max_window_secs.saturating_mul(2));
        let before = states.len();
        states.retain(|_, state| now.duration_since(state.window_start) < max_window);
        before - states.len()
    }

    /// Get the number of tracked keys.
    pub async fn key_count(&self) -> usize {
        self.states.read().await.len()
    }
}

/// Rate limit check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed.
    Allowed {
        /// Remaining requests in window.
        remaining: u32,
        /// Total limit.
        limit: u32,
        /// Seconds until window reset.
        reset: u64,
    },
    /// Request is rate limited.
    Limited {
        /// Seconds until the window resets.
        retry_after: u64,
        /// Total limit.
        limit: u32,
    },
}

/// Rate limiter state for middleware.
#[derive(Clone)]
pub struct RateLimiterState {
    limiter: ApiRateLimiter,
    snapshot: RateLimitConfig,
    vote: RateLimitConfig,
    write: RateLimitConfig,
}

impl RateLimiterState {
    /// Create limiter state from configured per-minute budgets.
    #[must_use]
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            limiter: ApiRateLimiter::new(),
            snapshot: RateLimitConfig::per_minute(settings.snapshot_per_minute),
            vote: RateLimitConfig::per_minute(settings.vote_per_minute),
            write: RateLimitConfig::per_minute(settings.write_per_minute),
        }
    }

    const fn config_for(&self, category: RateCategory) -> &RateLimitConfig {
        match category {
            RateCategory::Snapshot => &self.snapshot,
            RateCategory::Vote => &self.vote,
            RateCategory::Write => &self.write,
        }
    }

    /// Periodic cleanup of idle keys.
    pub async fn cleanup(&self) -> usize {
        self.limiter.cleanup(60).await
    }
}

/// Rate limit error response.
#[derive(Debug)]
pub struct RateLimitError {
    pub retry_after: u64,
    pub limit: u32,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        get_metrics().record_rate_limited();
        let mut response = AppError::RateLimited.into_response();
        let headers = response.headers_mut();
        headers.insert("Retry-After", HeaderValue::from(self.retry_after));
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
        headers.insert("X-RateLimit-Reset", HeaderValue::from(self.retry_after));
        response
    }
}

/// Extract client IP from proxy headers.
fn extract_client_ip(req: &Request<Body>) -> Option<IpAddr> {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
}

fn rate_key(req: &Request<Body>, category: RateCategory) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let who = extract_client_ip(req)
        .or(peer)
        .map_or_else(|| "unknown".to_string(), |ip| format!("ip:{ip}"));
    format!("{}:{who}", category.as_str())
}

/// Rate limiting for snapshot and read endpoints.
pub async fn rate_limit_snapshot(
    State(limiter): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_config(limiter, req, next, RateCategory::Snapshot).await
}

/// Rate limiting for vote casting.
pub async fn rate_limit_vote(
    State(limiter): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_config(limiter, req, next, RateCategory::Vote).await
}

/// Rate limiting for poll creation and management.
pub async fn rate_limit_write(
    State(limiter): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_config(limiter, req, next, RateCategory::Write).await
}

async fn rate_limit_with_config(
    limiter: RateLimiterState,
    req: Request<Body>,
    next: Next,
    category: RateCategory,
) -> Result<Response, RateLimitError> {
    let key = rate_key(&req, category);
    let config = *limiter.config_for(category);

    match limiter.limiter.check(&key, &config).await {
        RateLimitResult::Allowed {
            remaining,
            limit,
            reset,
        } => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", limit.into());
            headers.insert("X-RateLimit-Remaining", remaining.into());
            headers.insert("X-RateLimit-Reset", reset.into());
            Ok(response)
        }
        RateLimitResult::Limited { retry_after, limit } => {
            tracing::debug!(category = category.as_str(), retry_after, "Rate limited");
            Err(RateLimitError { retry_after, limit })
        }
    }
}
