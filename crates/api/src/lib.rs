//! HTTP API layer for Pollivu.
//!
//! - **Endpoints**: poll management, vote casting, snapshots, CSV export
//! - **Extractors**: voter session and creator token
//! - **Middleware**: session cookie, request metrics, rate limiting
//!
//! Built on Axum 0.8 with Tower middleware stack.

pub mod endpoints;
pub mod extractors;
pub mod middleware;
pub mod rate_limit;
pub mod response;

pub use endpoints::router;
pub use middleware::{AppState, SESSION_COOKIE, SessionSettings};
pub use rate_limit::{ApiRateLimiter, RateLimitConfig, RateLimiterState};
