//! Database layer for Pollivu.
//!
//! Services reach storage only through [`PollStore`]. [`PollRepository`]
//! implements it over `PostgreSQL`; [`MemoryPollStore`] keeps everything in
//! process memory for single-process development and tests.

pub mod entities;
pub mod memory;
pub mod migrations;
pub mod repositories;
pub mod store;
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use pollivu_common::{AppError, Config};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tracing::info;
use tracing::log::LevelFilter;

pub use memory::MemoryPollStore;
pub use repositories::PollRepository;
pub use store::{
    CastRequest, HourlyVotes, PollStore, PollWithOptions, Rejection, SettingsUpdate,
    VoteOutcome,
};

/// Initialize database connection.
pub async fn init(config: &Config) -> Result<DatabaseConnection, AppError> {
    let mut opt = ConnectOptions::new(&config.database.url);

    opt.max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(LevelFilter::Debug);

    Database::connect(opt)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}

/// Run pending migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), AppError> {
    use sea_orm_migration::MigratorTrait;
    migrations::Migrator::up(db, None)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}

/// Build the configured store: in-process for `memory://`, otherwise
/// `PostgreSQL` with migrations applied.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn PollStore>, AppError> {
    if config.database.is_memory() {
        info!("Using in-process poll store; votes are not persisted");
        return Ok(Arc::new(MemoryPollStore::new()));
    }

    let db = init(config).await?;
    migrate(&db).await?;
    info!("Database connected and migrated");
    Ok(Arc::new(PollRepository::new(Arc::new(db))))
}
