//! Poll option entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One answer choice of a poll.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "poll_option")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub poll_id: String,

    /// Option text, or its encoded ciphertext when the poll is encrypted.
    #[sea_orm(column_type = "Text")]
    pub text: String,

    /// Position in the option list.
    pub display_order: i32,

    /// Denormalized vote counter; never negative.
    pub vote_count: i64,
}

/// Relationships.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::poll::Entity",
        from = "Column::PollId",
        to = "super::poll::Column::Id",
        on_delete = "Cascade"
    )]
    Poll,

    #[sea_orm(has_many = "super::vote_record::Entity")]
    VoteRecords,
}

impl Related<super::poll::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Poll.def()
    }
}

impl Related<super::vote_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::VoteRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
