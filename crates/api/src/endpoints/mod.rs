//! API endpoints.

mod meta;
mod polls;

use axum::Router;

use crate::middleware::AppState;
use crate::rate_limit::RateLimiterState;

/// Create the API router, to be nested under `/api`.
pub fn router(limits: RateLimiterState) -> Router<AppState> {
    Router::new()
        .nest("/polls", polls::router(limits))
        .nest("/health", meta::health_router())
        .nest("/metrics", meta::metrics_router())
}
