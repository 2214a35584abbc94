//! Common utilities and shared types for Pollivu.
//!
//! This crate provides foundational components used across all Pollivu crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Cryptography**: Authenticated field encryption via [`CryptoVault`]
//! - **Voter identity**: Per-poll one-way voter tokens via [`VoterToken`]
//! - **ID Generation**: ULIDs and capability IDs via [`IdGenerator`]
//! - **Results**: Count and percentage aggregation via [`ResultAggregator`]
//! - **Snapshots**: Wire type and change classification for polling clients
//! - **Metrics**: Process counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use pollivu_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let poll_id = id_gen.generate_poll_id();
//!     println!("{} -> {poll_id}", config.server.url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod id;
pub mod metrics;
pub mod retry;
pub mod snapshot;
pub mod tally;
pub mod text;
pub mod voter;

pub use config::Config;
pub use crypto::{CryptoVault, EncryptedField};
pub use error::{AppError, AppResult};
pub use id::{IdGenerator, hash_token, is_valid_poll_id};
pub use metrics::{Metrics, MetricsSnapshot, Timer, get_metrics};
pub use retry::RetryConfig;
pub use snapshot::{PollSnapshot, SnapshotChange};
pub use tally::{OptionCount, OptionResult, ResultAggregator, Tally};
pub use text::sanitize_text;
pub use voter::{SessionId, VoterToken};
