//! Poll entity.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A poll, its settings, and its denormalized vote total.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "poll")]
pub struct Model {
    /// Capability ID (128 random bits, base64url).
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Question text, or its encoded ciphertext when `is_encrypted`.
    #[sea_orm(column_type = "Text")]
    pub question: String,

    /// Whether question and option texts are stored encrypted.
    pub is_encrypted: bool,

    pub created_at: DateTime<Utc>,

    /// Time of the last vote or settings mutation.
    pub updated_at: DateTime<Utc>,

    /// When the poll stops accepting votes (null for never).
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Closed by the creator.
    pub is_closed: bool,

    /// Listed on the public poll list.
    pub is_public: bool,

    /// Whether a voter may move their vote to another option.
    pub allow_vote_change: bool,

    /// Whether results are visible before voting.
    pub show_results_before_voting: bool,

    pub share_results_chart: bool,
    pub share_results_list: bool,
    pub share_insights: bool,

    /// SHA-256 hex of the creator token.
    pub creator_token_hash: String,

    /// Number of ledger records for this poll.
    pub total_votes: i64,

    /// Monotonic change marker, bumped with every mutation.
    pub version: i64,
}

/// Relationships.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::poll_option::Entity")]
    Options,

    #[sea_orm(has_many = "super::vote_record::Entity")]
    VoteRecords,
}

impl Related<super::poll_option::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Options.def()
    }
}

impl Related<super::vote_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VoteRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether the expiry time has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Open and not expired at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_closed && !self.is_expired_at(now)
    }
}
