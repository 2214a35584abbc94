//! Application configuration.

use serde::Deserialize;
use std::path::Path;

use crate::{AppError, AppResult};

/// Minimum accepted length of `security.secret_key`, in bytes.
pub const MIN_SECRET_KEY_LEN: usize = 32;

/// Minimum accepted length of `security.salt`, in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration (optional; enables the shared snapshot cache).
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Secrets used to derive the field encryption key.
    pub security: SecurityConfig,
    /// Poll limits and maintenance settings.
    #[serde(default)]
    pub polls: PollsConfig,
    /// Request rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    pub url: String,
    /// Whether the session cookie carries the `Secure` attribute.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
    /// Upper bound for a single vote-cast request, in milliseconds.
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL, or `memory://` for the in-process store.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl DatabaseConfig {
    /// Whether this configuration selects the in-process store.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Key-derivation inputs for the field encryption key.
///
/// The derived key only ever lives in process memory; these values are the
/// long-term secret it is derived from.
#[derive(Clone, Deserialize)]
pub struct SecurityConfig {
    /// Long-term application secret.
    #[serde(default)]
    pub secret_key: String,
    /// Fixed salt for key derivation.
    #[serde(default)]
    pub salt: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("secret_key", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

impl SecurityConfig {
    /// Reject a missing or too-short secret or salt.
    pub fn validate(&self) -> AppResult<()> {
        if self.secret_key.trim().is_empty() {
            return Err(AppError::Config("security.secret_key is required".to_string()));
        }
        if self.secret_key.len() < MIN_SECRET_KEY_LEN {
            return Err(AppError::Config(format!(
                "security.secret_key must be at least {MIN_SECRET_KEY_LEN} bytes"
            )));
        }
        if self.salt.trim().is_empty() {
            return Err(AppError::Config("security.salt is required".to_string()));
        }
        if self.salt.len() < MIN_SALT_LEN {
            return Err(AppError::Config(format!(
                "security.salt must be at least {MIN_SALT_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Poll limits and maintenance settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PollsConfig {
    /// Minimum number of options per poll.
    #[serde(default = "default_min_options")]
    pub min_options: usize,
    /// Maximum number of options per poll.
    #[serde(default = "default_max_options")]
    pub max_options: usize,
    /// Maximum question length in characters.
    #[serde(default = "default_max_question_length")]
    pub max_question_length: usize,
    /// Maximum option length in characters.
    #[serde(default = "default_max_option_length")]
    pub max_option_length: usize,
    /// Lifetime of a cached snapshot, in seconds.
    #[serde(default = "default_snapshot_cache_ttl_secs")]
    pub snapshot_cache_ttl_secs: u64,
    /// Interval between expiry sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Whether expired polls are deleted by the background sweep.
    #[serde(default = "default_true")]
    pub sweep_expired: bool,
}

impl Default for PollsConfig {
    fn default() -> Self {
        Self {
            min_options: default_min_options(),
            max_options: default_max_options(),
            max_question_length: default_max_question_length(),
            max_option_length: default_max_option_length(),
            snapshot_cache_ttl_secs: default_snapshot_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_expired: true,
        }
    }
}

/// Request rate limits (requests per minute per session).
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    /// Snapshot and read endpoints.
    #[serde(default = "default_snapshot_per_minute")]
    pub snapshot_per_minute: u32,
    /// Vote-cast endpoint.
    #[serde(default = "default_vote_per_minute")]
    pub vote_per_minute: u32,
    /// Poll management endpoints.
    #[serde(default = "default_write_per_minute")]
    pub write_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            snapshot_per_minute: default_snapshot_per_minute(),
            vote_per_minute: default_vote_per_minute(),
            write_per_minute: default_write_per_minute(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

const fn default_vote_timeout_ms() -> u64 {
    5000
}

const fn default_max_connections() -> u32 {
    100
}

const fn default_min_connections() -> u32 {
    5
}

fn default_redis_prefix() -> String {
    "pollivu".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_min_options() -> usize {
    2
}

const fn default_max_options() -> usize {
    10
}

const fn default_max_question_length() -> usize {
    500
}

const fn default_max_option_length() -> usize {
    200
}

const fn default_snapshot_cache_ttl_secs() -> u64 {
    3
}

const fn default_sweep_interval_secs() -> u64 {
    3600
}

const fn default_snapshot_per_minute() -> u32 {
    60
}

const fn default_vote_per_minute() -> u32 {
    30
}

const fn default_write_per_minute() -> u32 {
    30
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (via `dotenvy`, if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `POLLIVU_ENV`)
    /// 4. Environment variables with `POLLIVU_` prefix
    ///
    /// The security section is validated before returning, so a process
    /// without a usable secret and salt never gets a `Config`.
    pub fn load() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let env = std::env::var("POLLIVU_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("POLLIVU")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.security.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("POLLIVU")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.security.validate()?;
        Ok(config)
    }
}
