//! Database integration tests.
//!
//! These tests require a running `PostgreSQL` instance.
//! Run with: `cargo test -p pollivu-db --test db_integration -- --ignored`
//!
//! Environment variables:
//!   `TEST_DB_HOST` (default: localhost)
//!   `TEST_DB_PORT` (default: 5433)
//!   `TEST_DB_USER` (default: `pollivu_test`)
//!   `TEST_DB_PASSWORD` (default: `pollivu_test`)
//!   `TEST_DB_NAME` (default: `pollivu_test`)

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use chrono::Utc;
use pollivu_common::AppError;
use pollivu_db::entities::{poll, poll_option};
use pollivu_db::test_utils::{TestDatabase, TestDbConfig};
use pollivu_db::{CastRequest, PollRepository, PollStore, PollWithOptions, Rejection, VoteOutcome};

fn sample_poll(id: &str, allow_vote_change: bool) -> PollWithOptions {
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
            is_public: false,
            allow_vote_change,
            show_results_before_voting: false,
            share_results_chart: true,
            share_results_list: true,
            share_insights: true,
            creator_token_hash: "0".repeat(64),
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

fn cast(poll_id: &str, token: &str, option: &str, record_id: String) -> CastRequest {
    CastRequest {
        poll_id: poll_id.to_string(),
        option_id: format!("{poll_id}-{option}"),
        voter_token: token.to_string(),
        record_id,
        now: Utc::now(),
    }
}

async fn repo() -> (TestDatabase, Arc<PollRepository>) {
    let db = TestDatabase::create_migrated().await.expect("Failed to create database");
    // `DatabaseConnection` is not `Clone` with sea-orm's `mock` feature (enabled
    // for unit tests), so open a second connection to the same database.
    let conn = TestDatabase::with_config(db.config.clone())
        .await
        .expect("Failed to connect to database")
        .conn;
    let repo = Arc::new(PollRepository::new(Arc::new(conn)));
    (db, repo)
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_database_connection() {
    let config = TestDbConfig::default();
    let result = TestDatabase::with_config(config).await;
    assert!(result.is_ok(), "Failed to connect: {:?}", result.err());
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_concurrent_duplicate_casts_record_once() {
    let (db, repo) = repo().await;
    repo.create_poll(sample_poll("pgpoll0001", false)).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let repo = repo.clone();
            tokio::spawn(async move {
                repo.cast_vote(&cast("pgpoll0001", &"a".repeat(64), "blue", format!("rec{i}")))
                    .await
            })
        })
        .collect();

    let outcomes: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let casts = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(VoteOutcome::Cast)))
        .count();
    assert_eq!(casts, 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        Ok(VoteOutcome::Cast | VoteOutcome::Rejected(Rejection::AlreadyVoted))
    )));

    let view = repo.find_poll("pgpoll0001").await.unwrap().unwrap();
    assert_eq!(view.poll.total_votes, 1);
    assert_eq!(view.option_vote_sum(), 1);
    assert_eq!(repo.count_votes("pgpoll0001").await.unwrap(), 1);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_concurrent_distinct_voters_no_lost_updates() {
    let (db, repo) = repo().await;
    repo.create_poll(sample_poll("pgpoll0002", false)).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let repo = repo.clone();
            tokio::spawn(async move {
                let token = format!("{i:064}");
                repo.cast_vote(&cast("pgpoll0002", &token, "blue", format!("rec{i}")))
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        assert_eq!(result.unwrap().unwrap(), VoteOutcome::Cast);
    }

    let view = repo.find_poll("pgpoll0002").await.unwrap().unwrap();
    assert_eq!(view.options[1].vote_count, 10);
    assert_eq!(view.poll.total_votes, 10);
    assert_eq!(view.poll.version, 11);

    let timeline = repo.vote_timeline("pgpoll0002").await.unwrap();
    assert_eq!(timeline.iter().map(|h| h.count).sum::<i64>(), 10);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_vote_change_is_atomic() {
    let (db, repo) = repo().await;
    repo.create_poll(sample_poll("pgpoll0003", true)).await.unwrap();
    let token = "b".repeat(64);

    let first = repo
        .cast_vote(&cast("pgpoll0003", &token, "red", "rec1".to_string()))
        .await
        .unwrap();
    let second = repo
        .cast_vote(&cast("pgpoll0003", &token, "blue", "rec2".to_string()))
        .await
        .unwrap();

    assert_eq!(first, VoteOutcome::Cast);
    assert!(matches!(second, VoteOutcome::Changed { .. }));

    let view = repo.find_poll("pgpoll0003").await.unwrap().unwrap();
    assert_eq!(view.options[0].vote_count, 0);
    assert_eq!(view.options[1].vote_count, 1);
    assert_eq!(view.poll.total_votes, 1);

    db.drop_database().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_concurrent_vote_changes_same_voter() {
    let (db, repo) = repo().await;
    repo.create_poll(sample_poll("pgpoll0004", true)).await.unwrap();
    let token = "c".repeat(64);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let repo = repo.clone();
            let token = token.clone();
            let option = if i % 2 == 0 { "red" } else { "blue" };
            tokio::spawn(async move {
                // Conflicts are surfaced to the caller, which retries.
                for attempt in 0..5 {
                    let request = cast("pgpoll0004", &token, option, format!("rec{i}-{attempt}"));
                    match repo.cast_vote(&request).await {
                        Err(AppError::StorageConflict(_)) => tokio::task::yield_now().await,
                        other => return other,
                    }
                }
                Err(AppError::StorageConflict("retries exhausted".to_string()))
            })
        })
        .collect();

    let outcomes: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let fresh = outcomes
        .iter()
        .filter(|o| matches!(o, VoteOutcome::Cast))
        .count();
    assert_eq!(fresh, 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        VoteOutcome::Cast | VoteOutcome::Changed { .. } | VoteOutcome::Unchanged
    )));

    let view = repo.find_poll("pgpoll0004").await.unwrap().unwrap();
    assert_eq!(view.poll.total_votes, 1);
    assert_eq!(view.option_vote_sum(), 1);
    assert_eq!(repo.count_votes("pgpoll0004").await.unwrap(), 1);

    let record = repo.find_vote("pgpoll0004", &token).await.unwrap().unwrap();
    let held = view
        .options
        .iter()
        .find(|o| o.id == record.option_id)
        .unwrap();
    assert_eq!(held.vote_count, 1);

    db.drop_database().await.unwrap();
}

#[test]
fn test_config_from_env() {
    let config = TestDbConfig::default();
    assert!(!config.host.is_empty());
    assert!(config.port > 0);
    assert!(!config.username.is_empty());
    assert!(!config.database.is_empty());
}

#[test]
fn test_postgres_url_format() {
    let config = TestDbConfig::default();
    let url = config.postgres_url();
    assert!(url.ends_with("/postgres"));
}
