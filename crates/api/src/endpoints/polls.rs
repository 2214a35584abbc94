//! Poll endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::header,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use pollivu_common::{AppError, AppResult, OptionResult, PollSnapshot};
use pollivu_core::{
    CreatePollInput, CreatedPoll, EditPollInput, OptionView, PollAnalytics, PollView, VoterStatus,
};
use serde::{Deserialize, Serialize};

use crate::extractors::{CreatorToken, VoterSession};
use crate::middleware::AppState;
use crate::rate_limit::{RateLimiterState, rate_limit_snapshot, rate_limit_vote, rate_limit_write};
use crate::response::{ApiResponse, Created};

/// Default size of the public poll list.
const DEFAULT_LIST_LIMIT: u64 = 20;

/// Create the polls router, each route group under its own rate budget.
pub fn router(limits: RateLimiterState) -> Router<AppState> {
    let reads = Router::new()
        .route("/", get(list_public))
        .route("/{id}", get(show))
        .route("/{id}/snapshot", get(snapshot))
        .route("/{id}/export.csv", get(export_csv))
        .route("/{id}/analytics", get(analytics))
        .route_layer(from_fn_with_state(limits.clone(), rate_limit_snapshot));

    let votes = Router::new()
        .route("/{id}/vote", post(vote))
        .route_layer(from_fn_with_state(limits.clone(), rate_limit_vote));

    let writes = Router::new()
        .route("/", post(create))
        .route("/{id}", patch(edit).delete(remove))
        .route("/{id}/close", post(close))
        .route("/{id}/reopen", post(reopen))
        .route("/{id}/toggle-public", post(toggle_public))
        .route("/{id}/options", post(add_option))
        .route("/{id}/options/{option_id}", delete(remove_option))
        .route_layer(from_fn_with_state(limits, rate_limit_write));

    reads.merge(votes).merge(writes)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PollList {
    polls: Vec<PollView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollDetail {
    poll: PollView,
    voter_status: VoterStatus,
}

#[derive(Debug, Serialize)]
struct PollEnvelope {
    poll: PollView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteRequest {
    option_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoteResponse {
    outcome: &'static str,
    voted_option_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_votes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<OptionResult>>,
}

#[derive(Debug, Deserialize)]
struct AddOptionRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct OptionEnvelope {
    option: OptionView,
}

#[derive(Debug, Serialize)]
struct Empty {}

async fn list_public(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<ApiResponse<PollList>> {
    let polls = state
        .poll_service
        .list_public(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(ApiResponse::ok(PollList { polls }))
}

async fn show(
    State(state): State<AppState>,
    VoterSession(session): VoterSession,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<PollDetail>> {
    let poll = state.poll_service.get(&id).await?;
    let voter_status = state.poll_service.voter_status(&id, &session).await?;

    let poll = if !poll.show_results_before_voting && !voter_status.has_voted && poll.is_active {
        poll.hide_results()
    } else {
        poll
    };
    Ok(ApiResponse::ok(PollDetail { poll, voter_status }))
}

async fn snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PollSnapshot>> {
    Ok(Json(state.notifier.snapshot(&id).await?))
}

async fn export_csv(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let csv = state.poll_service.export_csv(&id).await?;
    let disposition = format!("attachment; filename=\"poll_{id}_results.csv\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    ))
}

async fn analytics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    creator: Option<CreatorToken>,
) -> AppResult<ApiResponse<PollAnalytics>> {
    let token = creator.as_ref().map(|CreatorToken(token)| token.as_str());
    Ok(ApiResponse::ok(state.poll_service.analytics(&id, token).await?))
}

async fn vote(
    State(state): State<AppState>,
    VoterSession(session): VoterSession,
    Path(id): Path<String>,
    Json(req): Json<VoteRequest>,
) -> AppResult<ApiResponse<VoteResponse>> {
    let cast = state.vote_ledger.cast(&session, &id, &req.option_id);
    let receipt = tokio::time::timeout(state.vote_timeout, cast)
        .await
        .map_err(|_| {
            tracing::warn!(poll_id = %id, "Vote cast timed out");
            AppError::Timeout
        })??;

    let (total_votes, results) = receipt
        .snapshot
        .map_or((None, None), |s| (Some(s.total_votes), Some(s.results)));
    Ok(ApiResponse::ok(VoteResponse {
        outcome: receipt.outcome.as_str(),
        voted_option_id: receipt.voted_option_id,
        total_votes,
        results,
    }))
}

async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreatePollInput>,
) -> AppResult<Created<CreatedPoll>> {
    Ok(Created(state.poll_service.create(input).await?))
}

async fn edit(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path(id): Path<String>,
    Json(input): Json<EditPollInput>,
) -> AppResult<ApiResponse<PollEnvelope>> {
    let poll = state.poll_service.edit(&id, &token, input).await?;
    Ok(ApiResponse::ok(PollEnvelope { poll }))
}

async fn remove(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<Empty>> {
    state.poll_service.delete(&id, &token).await?;
    Ok(ApiResponse::ok(Empty {}))
}

async fn close(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<PollEnvelope>> {
    let poll = state.poll_service.close(&id, &token).await?;
    Ok(ApiResponse::ok(PollEnvelope { poll }))
}

async fn reopen(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<PollEnvelope>> {
    let poll = state.poll_service.reopen(&id, &token).await?;
    Ok(ApiResponse::ok(PollEnvelope { poll }))
}

async fn toggle_public(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<PollEnvelope>> {
    let poll = state.poll_service.toggle_public(&id, &token).await?;
    Ok(ApiResponse::ok(PollEnvelope { poll }))
}

async fn add_option(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path(id): Path<String>,
    Json(req): Json<AddOptionRequest>,
) -> AppResult<Created<OptionEnvelope>> {
    let option = state.poll_service.add_option(&id, &token, &req.text).await?;
    Ok(Created(OptionEnvelope { option }))
}

async fn remove_option(
    State(state): State<AppState>,
    CreatorToken(token): CreatorToken,
    Path((id, option_id)): Path<(String, String)>,
) -> AppResult<ApiResponse<Empty>> {
    state
        .poll_service
        .remove_option(&id, &token, &option_id)
        .await?;
    Ok(ApiResponse::ok(Empty {}))
}
