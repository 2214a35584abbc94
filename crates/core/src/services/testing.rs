//! Fixtures shared by service tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pollivu_common::{AppError, AppResult, SessionId};
use pollivu_db::entities::{poll, poll_option, vote_record};
use pollivu_db::{
    CastRequest, HourlyVotes, MemoryPollStore, PollStore, PollWithOptions, SettingsUpdate,
    VoteOutcome,
};

/// A Red/Blue poll with predictable option IDs `{id}-red` and `{id}-blue`.
pub fn red_blue(id: &str, allow_vote_change: bool) -> PollWithOptions {
    let now = Utc::now();
    PollWithOptions {
        poll: poll::Model {
            id: id.to_string(),
            question: "Red or blue?".to_string(),
            is_encrypted: false,
            created_at: now,
            updated_at: now,
            expires_at: None,
            is_closed: false,
            is_public: true,
            allow_vote_change,
            show_results_before_voting: true,
            share_results_chart: true,
            share_results_list: true,
            share_insights: true,
            creator_token_hash: String::new(),
            total_votes: 0,
            version: 1,
        },
        options: ["Red", "Blue"]
            .iter()
            .enumerate()
            .map(|(i, text)| poll_option::Model {
                id: format!("{id}-{}", text.to_lowercase()),
                poll_id: id.to_string(),
                text: (*text).to_string(),
                display_order: i as i32,
                vote_count: 0,
            })
            .collect(),
    }
}

/// A distinct, well-formed session per `n`.
#[allow(clippy::unwrap_used)]
pub fn session(n: u32) -> SessionId {
    SessionId::new(format!("test-session-{n:08}-padding")).unwrap()
}

/// Memory store that counts reads, can slow them down or fail them, and can
/// inject storage conflicts into casts.
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: MemoryPollStore,
    pub reads: AtomicUsize,
    pub read_delay: Duration,
    pub pending_conflicts: AtomicU32,
    pub fail_reads: AtomicBool,
}

impl InstrumentedStore {
    pub fn with_read_delay(read_delay: Duration) -> Self {
        Self {
            read_delay,
            ..Self::default()
        }
    }

    pub fn with_conflicts(conflicts: u32) -> Self {
        Self {
            pending_conflicts: AtomicU32::new(conflicts),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PollStore for InstrumentedStore {
    async fn create_poll(&self, poll: PollWithOptions) -> AppResult<PollWithOptions> {
        self.inner.create_poll(poll).await
    }

    async fn find_poll(&self, poll_id: &str) -> AppResult<Option<PollWithOptions>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Database("connection reset".to_string()));
        }
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.inner.find_poll(poll_id).await
    }

    async fn list_public(&self, limit: u64) -> AppResult<Vec<PollWithOptions>> {
        self.inner.list_public(limit).await
    }

    async fn update_settings(
        &self,
        poll_id: &str,
        update: &SettingsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Option<poll::Model>> {
        self.inner.update_settings(poll_id, update, now).await
    }

    async fn add_option(
        &self,
        poll_id: &str,
        option: poll_option::Model,
        max_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<poll_option::Model> {
        self.inner.add_option(poll_id, option, max_options, now).await
    }

    async fn remove_option(
        &self,
        poll_id: &str,
        option_id: &str,
        min_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.inner
            .remove_option(poll_id, option_id, min_options, now)
            .await
    }

    async fn delete_poll(&self, poll_id: &str) -> AppResult<bool> {
        self.inner.delete_poll(poll_id).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        self.inner.delete_expired(now).await
    }

    async fn cast_vote(&self, request: &CastRequest) -> AppResult<VoteOutcome> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AppError::StorageConflict("could not serialize access".to_string()));
        }
        self.inner.cast_vote(request).await
    }

    async fn find_vote(
        &self,
        poll_id: &str,
        voter_token: &str,
    ) -> AppResult<Option<vote_record::Model>> {
        self.inner.find_vote(poll_id, voter_token).await
    }

    async fn count_votes(&self, poll_id: &str) -> AppResult<i64> {
        self.inner.count_votes(poll_id).await
    }

    async fn vote_timeline(&self, poll_id: &str) -> AppResult<Vec<HourlyVotes>> {
        self.inner.vote_timeline(poll_id).await
    }
}
