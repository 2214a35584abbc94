//! Scheduled maintenance tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pollivu_common::AppResult;
use pollivu_common::config::PollsConfig;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::cache::MemorySnapshotCache;
use super::poll::PollService;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between expiry sweeps (default: 1 hour).
    pub sweep_interval: Duration,
    /// Whether expired polls are deleted at all.
    pub sweep_expired: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            sweep_expired: true,
        }
    }
}

impl From<&PollsConfig> for SchedulerConfig {
    fn from(polls: &PollsConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(polls.sweep_interval_secs.max(1)),
            sweep_expired: polls.sweep_expired,
        }
    }
}

/// Executor for the expiry sweep.
#[async_trait]
pub trait SweepExecutor: Send + Sync {
    /// Delete polls past their expiry at `now`, returning how many went.
    async fn sweep_expired_polls(&self, now: DateTime<Utc>) -> AppResult<u64>;

    /// Release process-local resources that outlived their use.
    async fn purge_local_caches(&self) -> usize {
        0
    }
}

/// Sweep executor backed by the poll service and an optional local cache.
pub struct PollSweeper {
    polls: PollService,
    local_cache: Option<MemorySnapshotCache>,
}

impl PollSweeper {
    #[must_use]
    pub const fn new(polls: PollService, local_cache: Option<MemorySnapshotCache>) -> Self {
        Self { polls, local_cache }
    }
}

#[async_trait]
impl SweepExecutor for PollSweeper {
    async fn sweep_expired_polls(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.polls.sweep_expired(now).await
    }

    async fn purge_local_caches(&self) -> usize {
        match &self.local_cache {
            Some(cache) => cache.purge_expired().await,
            None => 0,
        }
    }
}

/// Spawn the periodic expiry sweep. Returns `None` when sweeping is off.
pub fn run_expiry_sweep<E: SweepExecutor + 'static>(
    config: SchedulerConfig,
    executor: Arc<E>,
) -> Option<JoinHandle<()>> {
    if !config.sweep_expired {
        tracing::info!("Expiry sweep disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = interval(config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match executor.sweep_expired_polls(Utc::now()).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(count, "Deleted expired polls");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to sweep expired polls");
                }
            }

            let purged = executor.purge_local_caches().await;
            if purged > 0 {
                tracing::debug!(purged, "Purged stale snapshot cache entries");
            }
        }
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingExecutor {
        runs: AtomicU64,
    }

    #[async_trait]
    impl SweepExecutor for CountingExecutor {
        async fn sweep_expired_polls(&self, _now: DateTime<Utc>) -> AppResult<u64> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
        assert!(config.sweep_expired);
    }

    #[test]
    fn test_scheduler_config_from_polls() {
        let polls = PollsConfig {
            sweep_interval_secs: 0,
            sweep_expired: false,
            ..PollsConfig::default()
        };
        let config = SchedulerConfig::from(&polls);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(!config.sweep_expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_every_interval() {
        let executor = Arc::new(CountingExecutor::default());
        let handle = run_expiry_sweep(
            SchedulerConfig {
                sweep_interval: Duration::from_secs(60),
                sweep_expired: true,
            },
            executor.clone(),
        )
        .unwrap();

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn test_disabled_sweep_spawns_nothing() {
        let executor = Arc::new(CountingExecutor::default());
        let config = SchedulerConfig {
            sweep_expired: false,
            ..SchedulerConfig::default()
        };
        assert!(run_expiry_sweep(config, executor).is_none());
    }
}
