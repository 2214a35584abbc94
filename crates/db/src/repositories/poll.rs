//! Poll repository backed by `PostgreSQL`.
//!
//! Every mutation runs in one transaction that first takes the poll row with
//! `SELECT ... FOR UPDATE`. That gives all writers of a poll the same lock
//! order (poll, then options, then ledger) and makes the closed/expired check
//! and the write it guards one atomic step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pollivu_common::{AppError, AppResult};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    AccessMode, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, FromQueryResult, IsolationLevel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    TransactionTrait,
};
use tracing::{debug, warn};

use crate::entities::{Poll, PollOption, VoteRecord, poll, poll_option, vote_record};
use crate::store::{
    CastRequest, ExistingVote, HourlyVotes, PollStore, PollWithOptions, SettingsUpdate,
    VoteOutcome, admit_cast, resolve_existing,
};

/// Poll repository for database operations.
#[derive(Clone)]
pub struct PollRepository {
    db: Arc<DatabaseConnection>,
}

impl PollRepository {
    /// Create a new poll repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn options_of<C: ConnectionTrait>(
        conn: &C,
        poll_id: &str,
    ) -> Result<Vec<poll_option::Model>, DbErr> {
        PollOption::find()
            .filter(poll_option::Column::PollId.eq(poll_id))
            .order_by_asc(poll_option::Column::DisplayOrder)
            .all(conn)
            .await
    }

    async fn lock_poll<C: ConnectionTrait>(
        conn: &C,
        poll_id: &str,
    ) -> Result<Option<poll::Model>, DbErr> {
        Poll::find_by_id(poll_id).lock_exclusive().one(conn).await
    }

    /// Bump version and `updated_at`, optionally adjusting the vote total.
    async fn touch_poll<C: ConnectionTrait>(
        conn: &C,
        poll_id: &str,
        total_delta: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let mut update = Poll::update_many()
            .col_expr(poll::Column::Version, Expr::col(poll::Column::Version).add(1))
            .col_expr(poll::Column::UpdatedAt, Expr::value(now));
        if total_delta != 0 {
            update = update.col_expr(
                poll::Column::TotalVotes,
                Expr::col(poll::Column::TotalVotes).add(total_delta),
            );
        }
        update
            .filter(poll::Column::Id.eq(poll_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    async fn increment_option<C: ConnectionTrait>(conn: &C, option_id: &str) -> Result<(), DbErr> {
        PollOption::update_many()
            .col_expr(
                poll_option::Column::VoteCount,
                Expr::col(poll_option::Column::VoteCount).add(1),
            )
            .filter(poll_option::Column::Id.eq(option_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    async fn decrement_option<C: ConnectionTrait>(conn: &C, option_id: &str) -> Result<(), DbErr> {
        PollOption::update_many()
            .col_expr(
                poll_option::Column::VoteCount,
                Expr::cust("GREATEST(vote_count - 1, 0)"),
            )
            .filter(poll_option::Column::Id.eq(option_id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// The body of a cast, run inside the caller's transaction.
    async fn cast_in<C: ConnectionTrait>(
        conn: &C,
        request: &CastRequest,
    ) -> Result<VoteOutcome, DbErr> {
        use crate::store::Rejection;

        let Some(poll) = Self::lock_poll(conn, &request.poll_id).await? else {
            return Ok(VoteOutcome::Rejected(Rejection::PollNotFound));
        };

        let option = PollOption::find_by_id(&request.option_id)
            .filter(poll_option::Column::PollId.eq(request.poll_id.as_str()))
            .one(conn)
            .await?;

        if let Err(rejection) = admit_cast(&poll, option.is_some(), request.now) {
            return Ok(VoteOutcome::Rejected(rejection));
        }

        let record = vote_record::ActiveModel {
            id: Set(request.record_id.clone()),
            poll_id: Set(request.poll_id.clone()),
            option_id: Set(request.option_id.clone()),
            voter_token: Set(request.voter_token.clone()),
            voted_at: Set(request.now),
        };

        let inserted = VoteRecord::insert(record)
            .on_conflict(
                OnConflict::columns([
                    vote_record::Column::PollId,
                    vote_record::Column::VoterToken,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;

        if inserted == 1 {
            Self::increment_option(conn, &request.option_id).await?;
            Self::touch_poll(conn, &request.poll_id, 1, request.now).await?;
            return Ok(VoteOutcome::Cast);
        }

        if !poll.allow_vote_change {
            return Ok(VoteOutcome::Rejected(Rejection::AlreadyVoted));
        }

        let Some(existing) = VoteRecord::find()
            .filter(vote_record::Column::PollId.eq(request.poll_id.as_str()))
            .filter(vote_record::Column::VoterToken.eq(request.voter_token.as_str()))
            .lock_exclusive()
            .one(conn)
            .await?
        else {
            // The conflicting row is not visible to this transaction; let
            // the caller retry against the new state.
            return Err(DbErr::Custom("could not serialize vote change".to_string()));
        };

        match resolve_existing(&poll, &existing.option_id, &request.option_id) {
            ExistingVote::Reject => Ok(VoteOutcome::Rejected(Rejection::AlreadyVoted)),
            ExistingVote::Keep => Ok(VoteOutcome::Unchanged),
            ExistingVote::Move => {
                Self::decrement_option(conn, &existing.option_id).await?;
                Self::increment_option(conn, &request.option_id).await?;

                VoteRecord::update_many()
                    .col_expr(
                        vote_record::Column::OptionId,
                        Expr::value(request.option_id.clone()),
                    )
                    .col_expr(vote_record::Column::VotedAt, Expr::value(request.now))
                    .filter(vote_record::Column::Id.eq(existing.id.as_str()))
                    .exec(conn)
                    .await?;

                Self::touch_poll(conn, &request.poll_id, 0, request.now).await?;

                Ok(VoteOutcome::Changed {
                    previous_option_id: existing.option_id,
                })
            }
        }
    }
}

/// Map a database error, classifying serialization failures and deadlocks
/// as retryable conflicts.
pub fn map_db_err(err: DbErr) -> AppError {
    let message = err.to_string();
    if is_transient(&message) {
        warn!(error = %message, "Transient storage conflict");
        AppError::StorageConflict(message)
    } else {
        AppError::Database(message)
    }
}

fn is_transient(message: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "40001",
        "40P01",
        "could not serialize",
        "deadlock detected",
        "lock timeout",
    ];
    MARKERS.iter().any(|marker| message.contains(marker))
}

#[async_trait]
impl PollStore for PollRepository {
    async fn create_poll(&self, poll: PollWithOptions) -> AppResult<PollWithOptions> {
        let txn = self.db.begin().await.map_err(map_db_err)?;

        let poll_model = poll::ActiveModel::from(poll.poll)
            .insert(&txn)
            .await
            .map_err(map_db_err)?;

        let mut options = Vec::with_capacity(poll.options.len());
        for option in poll.options {
            let option = poll_option::ActiveModel::from(option)
                .insert(&txn)
                .await
                .map_err(map_db_err)?;
            options.push(option);
        }

        txn.commit().await.map_err(map_db_err)?;

        Ok(PollWithOptions {
            poll: poll_model,
            options,
        })
    }

    async fn find_poll(&self, poll_id: &str) -> AppResult<Option<PollWithOptions>> {
        // Poll row and option counters must come from the same snapshot so
        // the version always matches the counts it is served with.
        let txn = self
            .db
            .begin_with_config(
                Some(IsolationLevel::RepeatableRead),
                Some(AccessMode::ReadOnly),
            )
            .await
            .map_err(map_db_err)?;

        let Some(poll) = Poll::find_by_id(poll_id)
            .one(&txn)
            .await
            .map_err(map_db_err)?
        else {
            txn.commit().await.map_err(map_db_err)?;
            return Ok(None);
        };

        let options = Self::options_of(&txn, poll_id)
            .await
            .map_err(map_db_err)?;
        txn.commit().await.map_err(map_db_err)?;

        Ok(Some(PollWithOptions { poll, options }))
    }

    async fn list_public(&self, limit: u64) -> AppResult<Vec<PollWithOptions>> {
        let polls = Poll::find()
            .filter(poll::Column::IsPublic.eq(true))
            .order_by_desc(poll::Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(map_db_err)?;

        let mut result = Vec::with_capacity(polls.len());
        for poll in polls {
            let options = Self::options_of(self.db.as_ref(), &poll.id)
                .await
                .map_err(map_db_err)?;
            result.push(PollWithOptions { poll, options });
        }
        Ok(result)
    }

    async fn update_settings(
        &self,
        poll_id: &str,
        update: &SettingsUpdate,
        now: DateTime<Utc>,
    ) -> AppResult<Option<poll::Model>> {
        let txn = self.db.begin().await.map_err(map_db_err)?;

        let Some(mut poll) = Self::lock_poll(&txn, poll_id).await.map_err(map_db_err)? else {
            return Ok(None);
        };

        update.apply_to(&mut poll);
        poll.version += 1;
        poll.updated_at = now;

        // total_votes stays NotSet: only the ledger paths write it.
        let active = poll::ActiveModel {
            id: Set(poll.id),
            question: Set(poll.question),
            allow_vote_change: Set(poll.allow_vote_change),
            show_results_before_voting: Set(poll.show_results_before_voting),
            is_public: Set(poll.is_public),
            is_closed: Set(poll.is_closed),
            share_results_chart: Set(poll.share_results_chart),
            share_results_list: Set(poll.share_results_list),
            share_insights: Set(poll.share_insights),
            expires_at: Set(poll.expires_at),
            version: Set(poll.version),
            updated_at: Set(poll.updated_at),
            ..Default::default()
        };

        let updated = active.update(&txn).await.map_err(map_db_err)?;
        txn.commit().await.map_err(map_db_err)?;

        debug!(poll_id = %poll_id, version = updated.version, "Poll settings updated");
        Ok(Some(updated))
    }

    async fn add_option(
        &self,
        poll_id: &str,
        option: poll_option::Model,
        max_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<poll_option::Model> {
        let txn = self.db.begin().await.map_err(map_db_err)?;

        if Self::lock_poll(&txn, poll_id)
            .await
            .map_err(map_db_err)?
            .is_none()
        {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }

        let existing = Self::options_of(&txn, poll_id)
            .await
            .map_err(map_db_err)?;
        if existing.len() >= max_options {
            return Err(AppError::Validation(format!(
                "A poll can have at most {max_options} options"
            )));
        }

        let display_order = existing
            .iter()
            .map(|o| o.display_order)
            .max()
            .map_or(0, |max| max + 1);

        let model = poll_option::Model {
            poll_id: poll_id.to_string(),
            display_order,
            vote_count: 0,
            ..option
        };
        let inserted = poll_option::ActiveModel::from(model)
            .insert(&txn)
            .await
            .map_err(map_db_err)?;

        Self::touch_poll(&txn, poll_id, 0, now)
            .await
            .map_err(map_db_err)?;
        txn.commit().await.map_err(map_db_err)?;

        Ok(inserted)
    }

    async fn remove_option(
        &self,
        poll_id: &str,
        option_id: &str,
        min_options: usize,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let txn = self.db.begin().await.map_err(map_db_err)?;

        if Self::lock_poll(&txn, poll_id)
            .await
            .map_err(map_db_err)?
            .is_none()
        {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }

        let options = Self::options_of(&txn, poll_id)
            .await
            .map_err(map_db_err)?;
        let Some(target) = options.iter().find(|o| o.id == option_id) else {
            return Err(AppError::InvalidOption);
        };
        if options.len() <= min_options {
            return Err(AppError::Validation(format!(
                "A poll must keep at least {min_options} options"
            )));
        }

        let removed = VoteRecord::delete_many()
            .filter(vote_record::Column::PollId.eq(poll_id))
            .filter(vote_record::Column::OptionId.eq(option_id))
            .exec(&txn)
            .await
            .map_err(map_db_err)?
            .rows_affected;

        PollOption::delete_by_id(option_id)
            .exec(&txn)
            .await
            .map_err(map_db_err)?;

        let removed = i64::try_from(removed).unwrap_or(target.vote_count);
        Self::touch_poll(&txn, poll_id, -removed, now)
            .await
            .map_err(map_db_err)?;
        txn.commit().await.map_err(map_db_err)?;

        debug!(poll_id = %poll_id, option_id = %option_id, removed, "Option removed");
        Ok(())
    }

    async fn delete_poll(&self, poll_id: &str) -> AppResult<bool> {
        let result = Poll::delete_by_id(poll_id)
            .exec(self.db.as_ref())
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let deleted = Poll::delete_many()
            .filter(poll::Column::ExpiresAt.is_not_null())
            .filter(poll::Column::ExpiresAt.lte(now))
            .exec_with_returning(self.db.as_ref())
            .await
            .map_err(map_db_err)?;
        Ok(deleted.into_iter().map(|p| p.id).collect())
    }

    async fn cast_vote(&self, request: &CastRequest) -> AppResult<VoteOutcome> {
        let txn = self.db.begin().await.map_err(map_db_err)?;
        let outcome = Self::cast_in(&txn, request).await.map_err(map_db_err)?;

        if outcome.is_mutation() {
            txn.commit().await.map_err(map_db_err)?;
        } else {
            txn.rollback().await.map_err(map_db_err)?;
        }

        Ok(outcome)
    }

    async fn find_vote(
        &self,
        poll_id: &str,
        voter_token: &str,
    ) -> AppResult<Option<vote_record::Model>> {
        VoteRecord::find()
            .filter(vote_record::Column::PollId.eq(poll_id))
            .filter(vote_record::Column::VoterToken.eq(voter_token))
            .one(self.db.as_ref())
            .await
            .map_err(map_db_err)
    }

    async fn count_votes(&self, poll_id: &str) -> AppResult<i64> {
        let count = VoteRecord::find()
            .filter(vote_record::Column::PollId.eq(poll_id))
            .count(self.db.as_ref())
            .await
            .map_err(map_db_err)?;
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn vote_timeline(&self, poll_id: &str) -> AppResult<Vec<HourlyVotes>> {
        #[derive(FromQueryResult)]
        struct HourRow {
            hour: DateTime<Utc>,
            count: i64,
        }

        let rows = VoteRecord::find()
            .filter(vote_record::Column::PollId.eq(poll_id))
            .select_only()
            .column_as(Expr::cust("date_trunc('hour', \"voted_at\")"), "hour")
            .column_as(vote_record::Column::Id.count(), "count")
            .group_by(Expr::cust("1"))
            .order_by_asc(Expr::cust("1"))
            .into_model::<HourRow>()
            .all(self.db.as_ref())
            .await
            .map_err(map_db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| HourlyVotes {
                hour: row.hour,
                count: row.count,
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::Rejection;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn create_test_poll(id: &str, allow_vote_change: bool) -> poll::Model {
        let now = Utc::now();
        poll::Model {
            id: id.to_string(),
            question: "Favourite colour?".to_string(),
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
        }
    }

    fn create_test_option(id: &str, poll_id: &str, order: i32) -> poll_option::Model {
        poll_option::Model {
            id: id.to_string(),
            poll_id: poll_id.to_string(),
            text: id.to_string(),
            display_order: order,
            vote_count: 0,
        }
    }

    fn exec(rows: u64) -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected: rows,
        }
    }

    fn request(option_id: &str) -> CastRequest {
        CastRequest {
            poll_id: "poll1".to_string(),
            option_id: option_id.to_string(),
            voter_token: "a".repeat(64),
            record_id: "vote1".to_string(),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_find_poll_returns_options() {
        let poll = create_test_poll("poll1", false);
        let red = create_test_option("red", "poll1", 0);
        let blue = create_test_option("blue", "poll1", 1);

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[poll.clone()]])
                .append_query_results([[red, blue]])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let found = repo.find_poll("poll1").await.unwrap().unwrap();

        assert_eq!(found.poll.id, "poll1");
        assert_eq!(found.options.len(), 2);
        assert_eq!(found.options[0].id, "red");
    }

    #[tokio::test]
    async fn test_find_poll_not_found() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([Vec::<poll::Model>::new()])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        assert!(repo.find_poll("missing1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cast_fresh_vote() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[create_test_poll("poll1", false)]])
                .append_query_results([[create_test_option("blue", "poll1", 1)]])
                // insert, option counter, poll counter
                .append_exec_results([exec(1), exec(1), exec(1)])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let outcome = repo.cast_vote(&request("blue")).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Cast);
    }

    #[tokio::test]
    async fn test_cast_duplicate_without_change_is_rejected() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[create_test_poll("poll1", false)]])
                .append_query_results([[create_test_option("blue", "poll1", 1)]])
                // insert hits the unique index and does nothing
                .append_exec_results([exec(0)])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let outcome = repo.cast_vote(&request("blue")).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Rejected(Rejection::AlreadyVoted));
    }

    #[tokio::test]
    async fn test_cast_on_closed_poll() {
        let mut poll = create_test_poll("poll1", false);
        poll.is_closed = true;

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[poll]])
                .append_query_results([[create_test_option("blue", "poll1", 1)]])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let outcome = repo.cast_vote(&request("blue")).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Rejected(Rejection::PollClosed));
    }

    #[tokio::test]
    async fn test_cast_foreign_option() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[create_test_poll("poll1", false)]])
                .append_query_results([Vec::<poll_option::Model>::new()])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let outcome = repo.cast_vote(&request("other")).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Rejected(Rejection::InvalidOption));
    }

    #[tokio::test]
    async fn test_cast_changes_existing_vote() {
        let existing = vote_record::Model {
            id: "vote0".to_string(),
            poll_id: "poll1".to_string(),
            option_id: "red".to_string(),
            voter_token: "a".repeat(64),
            voted_at: Utc::now(),
        };

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[create_test_poll("poll1", true)]])
                .append_query_results([[create_test_option("blue", "poll1", 1)]])
                .append_query_results([[existing]])
                // insert (conflict), decrement, increment, record, poll
                .append_exec_results([exec(0), exec(1), exec(1), exec(1), exec(1)])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let outcome = repo.cast_vote(&request("blue")).await.unwrap();

        assert_eq!(
            outcome,
            VoteOutcome::Changed {
                previous_option_id: "red".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cast_same_option_is_unchanged() {
        let existing = vote_record::Model {
            id: "vote0".to_string(),
            poll_id: "poll1".to_string(),
            option_id: "blue".to_string(),
            voter_token: "a".repeat(64),
            voted_at: Utc::now(),
        };

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[create_test_poll("poll1", true)]])
                .append_query_results([[create_test_option("blue", "poll1", 1)]])
                .append_query_results([[existing]])
                .append_exec_results([exec(0)])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let outcome = repo.cast_vote(&request("blue")).await.unwrap();

        assert_eq!(outcome, VoteOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_delete_expired_returns_ids() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([vec![
                    create_test_poll("gone0001", false),
                    create_test_poll("gone0002", false),
                ]])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        assert_eq!(
            repo.delete_expired(Utc::now()).await.unwrap(),
            vec!["gone0001", "gone0002"]
        );
    }

    #[tokio::test]
    async fn test_vote_timeline_maps_hour_rows() {
        use chrono::TimeZone;
        use sea_orm::Value;
        use std::collections::BTreeMap;

        let nine = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let eleven = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        let row = |hour: DateTime<Utc>, count: i64| {
            BTreeMap::from([("hour", Value::from(hour)), ("count", Value::from(count))])
        };
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([vec![row(nine, 2), row(eleven, 1)]])
                .into_connection(),
        );

        let repo = PollRepository::new(db);
        let timeline = repo.vote_timeline("poll0001").await.unwrap();

        assert_eq!(
            timeline,
            vec![
                HourlyVotes {
                    hour: nine,
                    count: 2
                },
                HourlyVotes {
                    hour: eleven,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_transient_errors_are_conflicts() {
        let err = map_db_err(DbErr::Custom(
            "error returned from database: could not serialize access".to_string(),
        ));
        assert!(matches!(err, AppError::StorageConflict(_)));

        let err = map_db_err(DbErr::Custom("deadlock detected".to_string()));
        assert!(matches!(err, AppError::StorageConflict(_)));

        let err = map_db_err(DbErr::Custom("relation does not exist".to_string()));
        assert!(matches!(err, AppError::Database(_)));
    }
}
