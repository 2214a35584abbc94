//! In-process poll store.
//!
//! Holds every poll behind one `RwLock`; each mutation takes the write lock
//! for its whole duration, which makes it the atomic unit. Only suitable for
//! a single process (`database.url = "memory://"`) and for tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use pollivu_common::{AppError, AppResult};
use tokio::sync::RwLock;
use tracing::debug;

use crate::entities::{poll, poll_option, vote_record};
use crate::store::{
    CastRequest, ExistingVote, HourlyVotes, PollStore, PollWithOptions, Rejection,
    SettingsUpdate, VoteOutcome, admit_cast, resolve_existing,
};

#[derive(Debug, Clone)]
struct PollState {
    poll: poll::Model,
    options: Vec<poll_option::Model>,
    /// Ledger keyed by voter token.
    votes: HashMap<String, vote_record::Model>,
}

impl PollState {
    fn view(&self) -> PollWithOptions {
        let mut options = self.options.clone();
        options.sort_by_key(|o| o.display_order);
        PollWithOptions {
            poll: self.poll.clone(),
            options,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.poll.version += 1;
        self.poll.updated_at = now;
    }

    fn option_mut(&mut self, option_id: &str) -> Option<&mut poll_option::Model> {
        self.options.iter_mut().find(|o| o.id == option_id)
    }
}

/// Poll store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryPollStore {
    polls: RwLock<HashMap<String, PollState>>,
}

impl MemoryPollStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn create_poll(&self, poll: PollWithOptions) -> AppResult<PollWithOptions> {
        let mut polls = self.polls.write().await;
        if polls.contains_key(&poll.poll.id) {
            return Err(AppError::Database(format!(
                "duplicate key value violates unique constraint: poll {}",
                poll.poll.id
            )));
        }

        let state = PollState {
            poll: poll.poll,
            options: poll.options,
            votes: HashMap::new(),
        };
        let view = state.view();
        polls.insert(view.poll.id.clone(), state);
        Ok(view)
    }

    async fn find_poll(&self, poll_id: &str) -> AppResult<Option<PollWithOptions>> {
        Ok(self.polls.read().await.get(poll_id).map(PollState::view))
    }

    async fn list_public(&self, limit: u64) -> AppResult<Vec<PollWithOptions>> {
        let polls = self.polls.read().await;
        let mut public: Vec<_> = polls
            .values()
            .filter(|s| s.poll.is_public)
            .map(PollState::view)
            .collect();
        public.sort_by(|a, b| b.poll.created_at.cmp(&a.poll.created_at));
        public.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(public)
    }

    async fn update_settings(
        &self,
        poll_id: &str,
        update: &SettingsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Option<poll::Model>> {
        let mut polls = self.polls.write().await;
        let Some(state) = polls.get_mut(poll_id) else {
            return Ok(None);
        };

        update.apply_to(&mut state.poll);
        state.touch(now);
        Ok(Some(state.poll.clone()))
    }

    async fn add_option(
        &self,
        poll_id: &str,
        option: poll_option::Model,
        max_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<poll_option::Model> {
        let mut polls = self.polls.write().await;
        let state = polls
            .get_mut(poll_id)
            .ok_or_else(|| AppError::PollNotFound(poll_id.to_string()))?;

        if state.options.len() >= max_options {
            return Err(AppError::Validation(format!(
                "A poll can have at most {max_options} options"
            )));
        }

        let display_order = state
            .options
            .iter()
            .map(|o| o.display_order)
            .max()
            .map_or(0, |max| max + 1);

        let option = poll_option::Model {
            poll_id: poll_id.to_string(),
            display_order,
            vote_count: 0,
            ..option
        };
        state.options.push(option.clone());
        state.touch(now);
        Ok(option)
    }

    async fn remove_option(
        &self,
        poll_id: &str,
        option_id: &str,
        min_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut polls = self.polls.write().await;
        let state = polls
            .get_mut(poll_id)
            .ok_or_else(|| AppError::PollNotFound(poll_id.to_string()))?;

        if !state.options.iter().any(|o| o.id == option_id) {
            return Err(AppError::InvalidOption);
        }
        if state.options.len() <= min_options {
            return Err(AppError::Validation(format!(
                "A poll must keep at least {min_options} options"
            )));
        }

        let before = state.votes.len();
        state.votes.retain(|_, record| record.option_id != option_id);
        let removed = (before - state.votes.len()) as i64;

        state.options.retain(|o| o.id != option_id);
        state.poll.total_votes -= removed;
        state.touch(now);

        debug!(poll_id = %poll_id, option_id = %option_id, removed, "Option removed");
        Ok(())
    }

    async fn delete_poll(&self, poll_id: &str) -> AppResult<bool> {
        Ok(self.polls.write().await.remove(poll_id).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let mut polls = self.polls.write().await;
        let mut deleted = Vec::new();
        polls.retain(|id, state| {
            let expired = state.poll.is_expired_at(now);
            if expired {
                deleted.push(id.clone());
            }
            !expired
        });
        Ok(deleted)
    }

    async fn cast_vote(&self, request: &CastRequest) -> AppResult<VoteOutcome> {
        let mut polls = self.polls.write().await;
        let Some(state) = polls.get_mut(&request.poll_id) else {
            return Ok(VoteOutcome::Rejected(Rejection::PollNotFound));
        };

        let option_belongs = state.options.iter().any(|o| o.id == request.option_id);
        if let Err(rejection) = admit_cast(&state.poll, option_belongs, request.now) {
            return Ok(VoteOutcome::Rejected(rejection));
        }

        let held = state
            .votes
            .get(&request.voter_token)
            .map(|record| record.option_id.clone());

        let Some(held) = held else {
            state.votes.insert(
                request.voter_token.clone(),
                vote_record::Model {
                    id: request.record_id.clone(),
                    poll_id: request.poll_id.clone(),
                    option_id: request.option_id.clone(),
                    voter_token: request.voter_token.clone(),
                    voted_at: request.now,
                },
            );
            if let Some(option) = state.option_mut(&request.option_id) {
                option.vote_count += 1;
            }
            state.poll.total_votes += 1;
            state.touch(request.now);
            return Ok(VoteOutcome::Cast);
        };

        match resolve_existing(&state.poll, &held, &request.option_id) {
            ExistingVote::Reject => Ok(VoteOutcome::Rejected(Rejection::AlreadyVoted)),
            ExistingVote::Keep => Ok(VoteOutcome::Unchanged),
            ExistingVote::Move => {
                if let Some(previous) = state.option_mut(&held) {
                    previous.vote_count = (previous.vote_count - 1).max(0);
                }
                if let Some(option) = state.option_mut(&request.option_id) {
                    option.vote_count += 1;
                }
                if let Some(record) = state.votes.get_mut(&request.voter_token) {
                    record.option_id = request.option_id.clone();
                    record.voted_at = request.now;
                }
                state.touch(request.now);
                Ok(VoteOutcome::Changed {
                    previous_option_id: held,
                })
            }
        }
    }

    async fn find_vote(
        &self,
        poll_id: &str,
        voter_token: &str,
    ) -> AppResult<Option<vote_record::Model>> {
        Ok(self
            .polls
            .read()
            .await
            .get(poll_id)
            .and_then(|state| state.votes.get(voter_token).cloned()))
    }

    async fn count_votes(&self, poll_id: &str) -> AppResult<i64> {
        Ok(self
            .polls
            .read()
            .await
            .get(poll_id)
            .map_or(0, |state| state.votes.len() as i64))
    }

    async fn vote_timeline(&self, poll_id: &str) -> AppResult<Vec<HourlyVotes>> {
        let polls = self.polls.read().await;
        let Some(state) = polls.get(poll_id) else {
            return Ok(Vec::new());
        };

        let mut hours: BTreeMap<DateTime<Utc>, i64> = BTreeMap::new();
        for record in state.votes.values() {
            let hour = record
                .voted_at
                .duration_trunc(TimeDelta::hours(1))
                .map_err(|e| AppError::Internal(e.to_string()))?;
            *hours.entry(hour).or_default() += 1;
        }
        Ok(hours
            .into_iter()
            .map(|(hour, count)| HourlyVotes { hour, count })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_poll(id: &str, allow_vote_change: bool) -> PollWithOptions {
        let now = Utc::now();
        PollWithOptions {
            poll: poll::Model {
                id: id.to_string(),
                question: "Colour?".to_string(),
                is_encrypted: false,
                created_at: now,
                updated_at: now,
                expires_at: None,
                is_closed: false,
                is_public: true,
                allow_vote_change,
                show_results_before_voting: false,
                share_results_chart: true,
                share_results_list: true,
                share_insights: true,
                creator_token_hash: "0".repeat(64),
                total_votes: 0,
                version: 1,
            },
            options: ["red", "blue", "green"]
                .iter()
                .enumerate()
                .map(|(i, text)| poll_option::Model {
                    id: (*text).to_string(),
                    poll_id: id.to_string(),
                    text: (*text).to_string(),
                    display_order: i as i32,
                    vote_count: 0,
                })
                .collect(),
        }
    }

    fn cast(poll_id: &str, token: &str, option_id: &str) -> CastRequest {
        CastRequest {
            poll_id: poll_id.to_string(),
            option_id: option_id.to_string(),
            voter_token: token.to_string(),
            record_id: format!("{token}-{option_id}"),
            now: Utc::now(),
        }
    }

    async fn assert_conserved(store: &MemoryPollStore, poll_id: &str) {
        let view = store.find_poll(poll_id).await.unwrap().unwrap();
        let records = store.count_votes(poll_id).await.unwrap();
        assert_eq!(view.option_vote_sum(), view.poll.total_votes);
        assert_eq!(view.poll.total_votes, records);
    }

    #[tokio::test]
    async fn test_cast_and_duplicate() {
        let store = MemoryPollStore::new();
        store.create_poll(sample_poll("poll1", false)).await.unwrap();

        let first = store.cast_vote(&cast("poll1", "t1", "blue")).await.unwrap();
        let second = store.cast_vote(&cast("poll1", "t1", "red")).await.unwrap();

        assert_eq!(first, VoteOutcome::Cast);
        assert_eq!(second, VoteOutcome::Rejected(Rejection::AlreadyVoted));
        assert_conserved(&store, "poll1").await;
    }

    #[tokio::test]
    async fn test_change_moves_counter() {
        let store = MemoryPollStore::new();
        store.create_poll(sample_poll("poll1", true)).await.unwrap();

        store.cast_vote(&cast("poll1", "t1", "red")).await.unwrap();
        let changed = store.cast_vote(&cast("poll1", "t1", "blue")).await.unwrap();

        assert!(matches!(changed, VoteOutcome::Changed { .. }));
        let view = store.find_poll("poll1").await.unwrap().unwrap();
        assert_eq!(view.options[0].vote_count, 0);
        assert_eq!(view.options[1].vote_count, 1);
        assert_eq!(view.poll.total_votes, 1);
        assert_conserved(&store, "poll1").await;
    }

    #[tokio::test]
    async fn test_remove_option_preserves_conservation() {
        let store = MemoryPollStore::new();
        store.create_poll(sample_poll("poll1", false)).await.unwrap();

        store.cast_vote(&cast("poll1", "t1", "red")).await.unwrap();
        store.cast_vote(&cast("poll1", "t2", "red")).await.unwrap();
        store.cast_vote(&cast("poll1", "t3", "blue")).await.unwrap();

        store
            .remove_option("poll1", "red", 2, Utc::now())
            .await
            .unwrap();

        let view = store.find_poll("poll1").await.unwrap().unwrap();
        assert_eq!(view.options.len(), 2);
        assert_eq!(view.poll.total_votes, 1);
        assert_conserved(&store, "poll1").await;

        let err = store
            .remove_option("poll1", "blue", 2, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_add_option_respects_limit_and_order() {
        let store = MemoryPollStore::new();
        store.create_poll(sample_poll("poll1", false)).await.unwrap();

        let template = poll_option::Model {
            id: "purple".to_string(),
            poll_id: String::new(),
            text: "purple".to_string(),
            display_order: 0,
            vote_count: 7,
        };
        let added = store
            .add_option("poll1", template.clone(), 4, Utc::now())
            .await
            .unwrap();
        assert_eq!(added.display_order, 3);
        assert_eq!(added.vote_count, 0);

        let err = store
            .add_option("poll1", template, 4, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_version_increases_on_every_mutation() {
        let store = MemoryPollStore::new();
        store.create_poll(sample_poll("poll1", false)).await.unwrap();
        let v0 = store.find_poll("poll1").await.unwrap().unwrap().poll.version;

        store.cast_vote(&cast("poll1", "t1", "red")).await.unwrap();
        let v1 = store.find_poll("poll1").await.unwrap().unwrap().poll.version;

        let update = SettingsUpdate {
            is_closed: Some(true),
            ..Default::default()
        };
        store
            .update_settings("poll1", &update, Utc::now())
            .await
            .unwrap();
        let v2 = store.find_poll("poll1").await.unwrap().unwrap().poll.version;

        // Rejected casts do not bump
        store.cast_vote(&cast("poll1", "t2", "red")).await.unwrap();
        let v3 = store.find_poll("poll1").await.unwrap().unwrap().poll.version;

        assert!(v1 > v0);
        assert!(v2 > v1);
        assert_eq!(v3, v2);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let store = MemoryPollStore::new();
        let mut expired = sample_poll("poll1", false);
        expired.poll.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.create_poll(expired).await.unwrap();
        store.create_poll(sample_poll("poll2", false)).await.unwrap();

        assert_eq!(store.delete_expired(Utc::now()).await.unwrap(), vec!["poll1"]);
        assert!(store.find_poll("poll1").await.unwrap().is_none());
        assert!(store.find_poll("poll2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_same_voter_single_record() {
        let store = Arc::new(MemoryPollStore::new());
        store.create_poll(sample_poll("poll1", false)).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.cast_vote(&cast("poll1", "same", "blue")).await })
            })
            .collect();

        let outcomes: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let casts = outcomes.iter().filter(|o| **o == VoteOutcome::Cast).count();
        assert_eq!(casts, 1);
        assert_eq!(store.count_votes("poll1").await.unwrap(), 1);
        assert_conserved(&store, "poll1").await;
    }

    #[tokio::test]
    async fn test_vote_timeline_groups_by_hour() {
        use chrono::TimeZone;

        let store = MemoryPollStore::new();
        store.create_poll(sample_poll("poll1", false)).await.unwrap();
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap();

        for (token, time) in [("t1", at(9, 5)), ("t2", at(9, 59)), ("t3", at(11, 0))] {
            let mut request = cast("poll1", token, "red");
            request.now = time;
            store.cast_vote(&request).await.unwrap();
        }

        let timeline = store.vote_timeline("poll1").await.unwrap();
        assert_eq!(
            timeline,
            vec![
                HourlyVotes {
                    hour: at(9, 0),
                    count: 2
                },
                HourlyVotes {
                    hour: at(11, 0),
                    count: 1
                },
            ]
        );
        assert!(store.vote_timeline("missing").await.unwrap().is_empty());
    }
}
