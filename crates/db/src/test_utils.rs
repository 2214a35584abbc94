//! Throwaway Postgres databases for the ledger integration tests.
//!
//! Connection details come from `TEST_DB_*` variables. Each test gets its own
//! freshly migrated database so concurrent casts never see another test's rows.

use sea_orm::{ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, Statement};
use tracing::info;

/// Where the test server lives.
#[derive(Debug, Clone)]
pub struct TestDbConfig {
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database username.
    pub username: String,
    /// Database password.
    pub password: String,
    /// Database name.
    pub database: String,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

impl Default for TestDbConfig {
    fn default() -> Self {
        Self {
            host: env_or("TEST_DB_HOST", "localhost"),
            port: std::env::var("TEST_DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5433),
            username: env_or("TEST_DB_USER", "pollivu_test"),
            password: env_or("TEST_DB_PASSWORD", "pollivu_test"),
            database: env_or("TEST_DB_NAME", "pollivu_test"),
        }
    }
}

impl TestDbConfig {
    fn url_for(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{database}",
            self.username, self.password, self.host, self.port
        )
    }

    /// URL of the configured database.
    #[must_use]
    pub fn database_url(&self) -> String {
        self.url_for(&self.database)
    }

    /// URL of the maintenance database used to create and drop test databases.
    #[must_use]
    pub fn postgres_url(&self) -> String {
        self.url_for("postgres")
    }

    /// Run statements against the maintenance database.
    async fn admin(&self, statements: &[String]) -> Result<(), DbErr> {
        let conn = Database::connect(&self.postgres_url()).await?;
        for sql in statements {
            conn.execute(Statement::from_string(DatabaseBackend::Postgres, sql.clone()))
                .await?;
        }
        conn.close().await
    }
}

/// An open connection to a test database.
pub struct TestDatabase {
    /// Database connection.
    pub conn: DatabaseConnection,
    /// Database configuration.
    pub config: TestDbConfig,
}

impl TestDatabase {
    /// Connect to an existing database.
    pub async fn with_config(config: TestDbConfig) -> Result<Self, DbErr> {
        let conn = Database::connect(&config.database_url()).await?;
        info!(database = %config.database, "Connected to test database");
        Ok(Self { conn, config })
    }

    /// Create an empty database with a random name and connect to it.
    pub async fn create_unique() -> Result<Self, DbErr> {
        let mut config = TestDbConfig::default();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        config.database = format!("pollivu_test_{}", &suffix[..8]);

        config
            .admin(&[format!("CREATE DATABASE \"{}\"", config.database)])
            .await?;
        info!(database = %config.database, "Created test database");
        Self::with_config(config).await
    }

    /// Like [`Self::create_unique`], with the schema applied.
    pub async fn create_migrated() -> Result<Self, DbErr> {
        use sea_orm_migration::MigratorTrait;

        let db = Self::create_unique().await?;
        crate::migrations::Migrator::up(&db.conn, None).await?;
        Ok(db)
    }

    /// Database connection.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Close the connection and drop the database.
    pub async fn drop_database(self) -> Result<(), DbErr> {
        self.conn.close().await?;

        let name = &self.config.database;
        // Pool connections may still be lingering server-side.
        self.config
            .admin(&[format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = '{name}' AND pid <> pg_backend_pid()"
            )])
            .await
            .ok();
        self.config
            .admin(&[format!("DROP DATABASE IF EXISTS \"{name}\"")])
            .await?;

        info!(database = %name, "Dropped test database");
        Ok(())
    }
}
