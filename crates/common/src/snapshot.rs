//! Poll snapshots and change classification.
//!
//! A snapshot is the cheap, authoritative view polling clients fetch on every
//! tick. It carries the poll's version so a client can tell whether anything
//! happened since its last look, and enough status flags to tell a count
//! update apart from a structural one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tally::OptionResult;

/// Point-in-time view of a poll's aggregate state.
///
/// Option texts are deliberately absent: snapshots may be cached outside the
/// process and must never hold decrypted poll content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    /// Poll ID.
    pub poll_id: String,
    /// Monotonic version, bumped on every vote or settings mutation.
    pub version: i64,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Total number of ledger records.
    pub total_votes: i64,
    /// Open and not expired.
    pub is_active: bool,
    /// Closed by the creator.
    pub is_closed: bool,
    /// Past its expiry time.
    pub is_expired: bool,
    /// Listed publicly.
    pub is_public: bool,
    /// Expiry time, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Per-option results in display order.
    pub results: Vec<OptionResult>,
}

/// How a newly fetched snapshot relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotChange {
    /// Nothing changed.
    Unchanged,
    /// Only vote counts moved; a client may patch counts in place.
    CountsChanged,
    /// Status, visibility, expiry or the option set changed; a client should
    /// reload the full poll.
    Structural,
}

impl SnapshotChange {
    /// Classify `next` relative to `prev`.
    #[must_use]
    pub fn between(prev: &PollSnapshot, next: &PollSnapshot) -> Self {
        let same_options = prev.results.len() == next.results.len()
            && prev
                .results
                .iter()
                .zip(&next.results)
                .all(|(a, b)| a.option_id == b.option_id);

        if prev.poll_id != next.poll_id
            || prev.is_closed != next.is_closed
            || prev.is_active != next.is_active
            || prev.is_expired != next.is_expired
            || prev.is_public != next.is_public
            || prev.expires_at != next.expires_at
            || !same_options
        {
            return Self::Structural;
        }

        let same_counts = prev.total_votes == next.total_votes
            && prev
                .results
                .iter()
                .zip(&next.results)
                .all(|(a, b)| a.votes == b.votes);

        if prev.version == next.version && same_counts {
            Self::Unchanged
        } else if same_counts {
            // Settings bump that does not affect any field shown here,
            // e.g. an edited question.
            Self::Structural
        } else {
            Self::CountsChanged
        }
    }
}
