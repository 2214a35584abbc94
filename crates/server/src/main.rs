//! Pollivu server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware};
use fred::prelude::*;
use pollivu_api::middleware::{AppState, SessionSettings, metrics_middleware, session_middleware};
use pollivu_api::{RateLimiterState, router as api_router};
use pollivu_common::{Config, CryptoVault, RetryConfig};
use pollivu_core::{
    ChangeNotifier, MemorySnapshotCache, PollService, PollSweeper, RedisSnapshotCache,
    SchedulerConfig, SnapshotCache, VoteLedger, run_expiry_sweep,
};
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interval between rate limiter cleanups.
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Pick the snapshot cache: Redis when configured so every worker shares it,
/// otherwise a per-process map that the sweep also purges.
async fn build_cache(
    config: &Config,
) -> Result<(Arc<dyn SnapshotCache>, Option<MemorySnapshotCache>), Box<dyn std::error::Error>> {
    let ttl = Duration::from_secs(config.polls.snapshot_cache_ttl_secs);

    let Some(redis) = &config.redis else {
        info!("No Redis configured, using in-process snapshot cache");
        let cache = MemorySnapshotCache::new(ttl);
        return Ok((Arc::new(cache.clone()), Some(cache)));
    };

    info!("Connecting to Redis...");
    let fred_config = fred::types::config::Config::from_url(&redis.url)?;
    let client = fred::clients::Client::new(fred_config, None, None, None);
    client.connect();
    client.wait_for_connect().await?;
    info!("Connected to Redis for shared snapshot caching");

    let cache = RedisSnapshotCache::new(Arc::new(client), redis.prefix.clone(), ttl);
    Ok((Arc::new(cache), None))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pollivu=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting Pollivu server...");

    // Missing or weak secrets stop the process here.
    let config = Config::load().inspect_err(|e| {
        error!(error = %e, "Invalid configuration, refusing to start");
    })?;

    let vault = Arc::new(CryptoVault::from_config(&config.security)?);
    info!("Encryption key derived");

    let store = pollivu_db::connect_store(&config).await?;
    let (cache, local_cache) = build_cache(&config).await?;

    // Services
    let notifier = ChangeNotifier::new(store.clone(), cache);
    let poll_service = PollService::new(
        store.clone(),
        notifier.clone(),
        vault,
        config.polls.clone(),
    );
    let vote_ledger = VoteLedger::new(store, notifier.clone(), RetryConfig::default());

    // Background jobs
    let sweeper = Arc::new(PollSweeper::new(poll_service.clone(), local_cache));
    let _sweep = run_expiry_sweep(SchedulerConfig::from(&config.polls), sweeper);

    let rate_limiter = RateLimiterState::new(&config.rate_limit);
    {
        let rate_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = rate_limiter.cleanup().await;
                if removed > 0 {
                    tracing::debug!(removed, "Cleaned up idle rate limit keys");
                }
            }
        });
    }

    let state = AppState {
        poll_service,
        vote_ledger,
        notifier,
        vote_timeout: Duration::from_millis(config.server.vote_timeout_ms),
    };

    // Build router
    let app = Router::new()
        .nest("/api", api_router(rate_limiter))
        .layer(middleware::from_fn_with_state(
            SessionSettings {
                secure: config.server.secure_cookies,
            },
            session_middleware,
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");
    Ok(())
}
