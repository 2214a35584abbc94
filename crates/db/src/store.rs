//! Storage seam for polls and the vote ledger.
//!
//! Services talk to storage only through [`PollStore`]. Every method that
//! mutates a poll runs as one atomic unit in the backing store and bumps the
//! poll's `version` and `updated_at` inside that same unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pollivu_common::{AppError, AppResult};

use crate::entities::{poll, poll_option, vote_record};

/// Ledger records whose `voted_at` falls in one clock hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourlyVotes {
    /// Start of the hour.
    pub hour: DateTime<Utc>,
    pub count: i64,
}

/// A poll together with its options in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollWithOptions {
    pub poll: poll::Model,
    pub options: Vec<poll_option::Model>,
}

impl PollWithOptions {
    /// Sum of option counters.
    #[must_use]
    pub fn option_vote_sum(&self) -> i64 {
        self.options.iter().map(|o| o.vote_count).sum()
    }
}

/// A vote-cast request as seen by the ledger.
#[derive(Debug, Clone)]
pub struct CastRequest {
    pub poll_id: String,
    pub option_id: String,
    /// Hex voter token; never the raw session identifier.
    pub voter_token: String,
    /// ID for the ledger record if this turns out to be a fresh vote.
    pub record_id: String,
    pub now: DateTime<Utc>,
}

/// Why the ledger refused a cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    PollNotFound,
    PollClosed,
    PollExpired,
    InvalidOption,
    AlreadyVoted,
}

impl Rejection {
    /// The user-facing error for this rejection.
    #[must_use]
    pub fn into_error(self, poll_id: &str) -> AppError {
        match self {
            Self::PollNotFound => AppError::PollNotFound(poll_id.to_string()),
            Self::PollClosed => AppError::PollClosed,
            Self::PollExpired => AppError::PollExpired,
            Self::InvalidOption => AppError::InvalidOption,
            Self::AlreadyVoted => AppError::AlreadyVoted,
        }
    }
}

/// Result of a cast attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// A fresh ledger record was written.
    Cast,
    /// An existing record was moved to another option.
    Changed { previous_option_id: String },
    /// The voter re-cast the option they already hold; nothing was written.
    Unchanged,
    /// Refused without any mutation.
    Rejected(Rejection),
}

impl VoteOutcome {
    /// Whether the ledger was mutated.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(self, Self::Cast | Self::Changed { .. })
    }

    /// Stable name for logs and API responses.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cast => "cast",
            Self::Changed { .. } => "changed",
            Self::Unchanged => "unchanged",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Check the poll-level preconditions of a cast, in the order the user
/// should hear about them.
pub fn admit_cast(
    poll: &poll::Model,
    option_belongs: bool,
    now: DateTime<Utc>,
) -> Result<(), Rejection> {
    if poll.is_closed {
        return Err(Rejection::PollClosed);
    }
    if poll.is_expired_at(now) {
        return Err(Rejection::PollExpired);
    }
    if !option_belongs {
        return Err(Rejection::InvalidOption);
    }
    Ok(())
}

/// What to do when the voter already holds a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingVote {
    Reject,
    Keep,
    Move,
}

/// Decide how a cast resolves against an existing record.
#[must_use]
pub fn resolve_existing(poll: &poll::Model, held_option_id: &str, requested: &str) -> ExistingVote {
    if !poll.allow_vote_change {
        ExistingVote::Reject
    } else if held_option_id == requested {
        ExistingVote::Keep
    } else {
        ExistingVote::Move
    }
}

/// Partial settings update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    /// New question text (already encoded if the poll is encrypted).
    pub question: Option<String>,
    pub allow_vote_change: Option<bool>,
    pub show_results_before_voting: Option<bool>,
    pub is_public: Option<bool>,
    pub is_closed: Option<bool>,
    pub share_results_chart: Option<bool>,
    pub share_results_list: Option<bool>,
    pub share_insights: Option<bool>,
    /// `Some(None)` clears the expiry.
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl SettingsUpdate {
    /// Apply this update to an in-memory model.
    pub fn apply_to(&self, poll: &mut poll::Model) {
        if let Some(question) = &self.question {
            poll.question = question.clone();
        }
        if let Some(v) = self.allow_vote_change {
            poll.allow_vote_change = v;
        }
        if let Some(v) = self.show_results_before_voting {
            poll.show_results_before_voting = v;
        }
        if let Some(v) = self.is_public {
            poll.is_public = v;
        }
        if let Some(v) = self.is_closed {
            poll.is_closed = v;
        }
        if let Some(v) = self.share_results_chart {
            poll.share_results_chart = v;
        }
        if let Some(v) = self.share_results_list {
            poll.share_results_list = v;
        }
        if let Some(v) = self.share_insights {
            poll.share_insights = v;
        }
        if let Some(expires_at) = self.expires_at {
            poll.expires_at = expires_at;
        }
    }
}

/// Storage operations for polls, options and the vote ledger.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Insert a poll and its options.
    async fn create_poll(&self, poll: PollWithOptions) -> AppResult<PollWithOptions>;

    /// Read a poll and its options as one consistent view.
    async fn find_poll(&self, poll_id: &str) -> AppResult<Option<PollWithOptions>>;

    /// Newest public polls.
    async fn list_public(&self, limit: u64) -> AppResult<Vec<PollWithOptions>>;

    /// Apply a settings update, returning the new poll row.
    async fn update_settings(
        &self,
        poll_id: &str,
        update: &SettingsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Option<poll::Model>>;

    /// Append an option after the highest display order, refusing to grow
    /// the poll past `max_options`.
    async fn add_option(
        &self,
        poll_id: &str,
        option: poll_option::Model,
        max_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<poll_option::Model>;

    /// Remove an option, its ledger records and their share of the total,
    /// refusing to shrink the poll below `min_options`.
    async fn remove_option(
        &self,
        poll_id: &str,
        option_id: &str,
        min_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Delete a poll with its options and ledger records.
    async fn delete_poll(&self, poll_id: &str) -> AppResult<bool>;

    /// Delete every poll whose expiry has passed at `now`, returning the
    /// deleted ids.
    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>>;

    /// Record a vote atomically.
    ///
    /// Transient conflicts surface as [`AppError::StorageConflict`] and are
    /// safe to retry: the voter token is the dedup key.
    async fn cast_vote(&self, request: &CastRequest) -> AppResult<VoteOutcome>;

    /// The ledger record held by `voter_token`, if any.
    async fn find_vote(
        &self,
        poll_id: &str,
        voter_token: &str,
    ) -> AppResult<Option<vote_record::Model>>;

    /// Number of ledger records for a poll.
    async fn count_votes(&self, poll_id: &str) -> AppResult<i64>;

    /// Ledger records per hour, oldest first. Changed votes count at the
    /// time of the change.
    async fn vote_timeline(&self, poll_id: &str) -> AppResult<Vec<HourlyVotes>>;
}
