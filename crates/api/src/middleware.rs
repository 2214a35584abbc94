//! API middleware.

#![allow(missing_docs)]

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use pollivu_common::{IdGenerator, SessionId, Timer, get_metrics};
use pollivu_core::{ChangeNotifier, PollService, VoteLedger};

/// Name of the cookie carrying the voter session.
pub const SESSION_COOKIE: &str = "pollivu_session";

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub poll_service: PollService,
    pub vote_ledger: VoteLedger,
    pub notifier: ChangeNotifier,
    /// Upper bound for a single vote-cast request.
    pub vote_timeout: Duration,
}

/// Session cookie settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub secure: bool,
}

/// Attach the voter session to every request, issuing a fresh one when the
/// cookie is missing or malformed.
pub async fn session_middleware(
    State(settings): State<SessionSettings>,
    jar: CookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let existing = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| SessionId::new(cookie.value()).ok());

    match existing {
        Some(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        None => {
            let value = IdGenerator::new().generate_session_id();
            let session = match SessionId::new(value.clone()) {
                Ok(session) => session,
                Err(e) => return e.into_response(),
            };
            req.extensions_mut().insert(session);
            let response = next.run(req).await;

            let cookie = Cookie::build((SESSION_COOKIE, value))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .secure(settings.secure);
            (jar.add(cookie), response).into_response()
        }
    }
}

/// Count requests and latency.
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let timer = Timer::start();
    let response = next.run(req).await;
    get_metrics().record_http_request(response.status().as_u16(), timer.elapsed());
    response
}
