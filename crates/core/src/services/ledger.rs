//! Vote ledger service.
//!
//! Turns a voter session and an option choice into one atomic store call.
//! Uniqueness comes from the store: the voter token is the dedup key, so a
//! retried cast after a transient conflict resolves against whatever the
//! first attempt committed.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use pollivu_common::{
    AppError, AppResult, IdGenerator, PollSnapshot, RetryConfig, SessionId, VoterToken,
    get_metrics, is_valid_poll_id,
};
use pollivu_db::{CastRequest, PollStore, VoteOutcome};
use tracing::{debug, error, info, warn};

use super::notifier::ChangeNotifier;

/// What the voter gets back after a cast.
#[derive(Debug, Clone)]
pub struct CastReceipt {
    pub outcome: VoteOutcome,
    /// The option the voter now holds.
    pub voted_option_id: String,
    /// Snapshot taken after the cast committed. `None` when the read failed;
    /// the vote itself is recorded either way.
    pub snapshot: Option<PollSnapshot>,
}

/// Vote ledger service.
#[derive(Clone)]
pub struct VoteLedger {
    store: Arc<dyn PollStore>,
    notifier: ChangeNotifier,
    retry: RetryConfig,
    id_gen: IdGenerator,
}

impl VoteLedger {
    /// Create a new ledger service.
    #[must_use]
    pub fn new(store: Arc<dyn PollStore>, notifier: ChangeNotifier, retry: RetryConfig) -> Self {
        Self {
            store,
            notifier,
            retry,
            id_gen: IdGenerator::new(),
        }
    }

    /// Cast, change, or re-confirm a vote for `session` on `poll_id`.
    ///
    /// Rejections come back as their precise [`AppError`] variant. Storage
    /// conflicts are retried with backoff and surface as
    /// [`AppError::StorageConflict`] once the retry budget is spent.
    pub async fn cast(
        &self,
        session: &SessionId,
        poll_id: &str,
        option_id: &str,
    ) -> AppResult<CastReceipt> {
        if !is_valid_poll_id(poll_id) {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }

        let token = VoterToken::derive(session, poll_id);
        let outcome = self.cast_with_retry(&token, poll_id, option_id).await?;
        let metrics = get_metrics();

        match &outcome {
            VoteOutcome::Rejected(rejection) => {
                metrics.votes_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    poll_id = %poll_id,
                    voter = %token.short(),
                    reason = ?rejection,
                    "Vote rejected"
                );
                return Err(rejection.into_error(poll_id));
            }
            VoteOutcome::Cast => {
                metrics.votes_cast.fetch_add(1, Ordering::Relaxed);
            }
            VoteOutcome::Changed { .. } => {
                metrics.votes_changed.fetch_add(1, Ordering::Relaxed);
            }
            VoteOutcome::Unchanged => {}
        }

        if outcome.is_mutation() {
            self.notifier.invalidate(poll_id).await;
        }
        let snapshot = match self.notifier.snapshot(poll_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(poll_id = %poll_id, error = %e, "Snapshot read failed after cast");
                None
            }
        };

        info!(
            poll_id = %poll_id,
            outcome = outcome.as_str(),
            voter = %token.short(),
            version = snapshot.as_ref().map(|s| s.version),
            "Vote processed"
        );

        Ok(CastReceipt {
            outcome,
            voted_option_id: option_id.to_string(),
            snapshot,
        })
    }

    async fn cast_with_retry(
        &self,
        token: &VoterToken,
        poll_id: &str,
        option_id: &str,
    ) -> AppResult<VoteOutcome> {
        let mut attempt = 0;
        loop {
            let request = CastRequest {
                poll_id: poll_id.to_string(),
                option_id: option_id.to_string(),
                voter_token: token.as_str().to_string(),
                record_id: self.id_gen.generate(),
                now: Utc::now(),
            };

            match self.store.cast_vote(&request).await {
                Ok(outcome) => return Ok(outcome),
                Err(AppError::StorageConflict(reason)) if self.retry.should_retry(attempt) => {
                    get_metrics()
                        .storage_conflicts_retried
                        .fetch_add(1, Ordering::Relaxed);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        poll_id = %poll_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Storage conflict, retrying cast"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AppError::StorageConflict(reason)) => {
                    get_metrics()
                        .storage_conflicts_exhausted
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        poll_id = %poll_id,
                        attempt,
                        reason = %reason,
                        "Cast failed after exhausting retries"
                    );
                    return Err(AppError::StorageConflict(
                        "vote could not be recorded, try again".to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
