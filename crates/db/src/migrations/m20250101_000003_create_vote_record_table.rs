//! Create `vote_record` table.
//!
//! The unique index on `(poll_id, voter_token)` is the one-vote guarantee;
//! later migrations must keep exactly this key.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(VoteRecord::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VoteRecord::Id)
                            .string_len(32)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(VoteRecord::PollId).string_len(32).not_null())
                    .col(
                        ColumnDef::new(VoteRecord::OptionId)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VoteRecord::VoterToken)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VoteRecord::VotedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_vote_record_poll")
                            .from(VoteRecord::Table, VoteRecord::PollId)
                            .to(Poll::Table, Poll::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_vote_record_option")
                            .from(VoteRecord::Table, VoteRecord::OptionId)
                            .to(PollOption::Table, PollOption::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One vote per voter per poll
        manager
            .create_index(
                Index::create()
                    .name("uq_vote_record_poll_voter")
                    .table(VoteRecord::Table)
                    .col(VoteRecord::PollId)
                    .col(VoteRecord::VoterToken)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Index on option_id for option removal
        manager
            .create_index(
                Index::create()
                    .name("idx_vote_record_option_id")
                    .table(VoteRecord::Table)
                    .col(VoteRecord::OptionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(VoteRecord::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum VoteRecord {
    Table,
    Id,
    PollId,
    OptionId,
    VoterToken,
    VotedAt,
}

#[derive(Iden)]
enum Poll {
    Table,
    Id,
}

#[derive(Iden)]
enum PollOption {
    Table,
    Id,
}
