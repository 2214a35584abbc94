//! Polling client for Pollivu.
//!
//! - **Governor**: adaptive backoff between snapshot requests via [`RateGovernor`]
//! - **Watcher**: background snapshot polling via [`SnapshotWatcher`]

pub mod governor;
pub mod watcher;

pub use governor::{GovernorConfig, PollSignal, RateGovernor};
pub use watcher::{
    FetchError, HttpSnapshotSource, SnapshotSource, SnapshotWatcher, WatchEvent, WatcherHandle,
};
