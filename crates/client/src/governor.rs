//! Adaptive polling interval.
//!
//! The governor owns the delay between two snapshot requests. It starts at a
//! base interval, doubles on every rate-limit signal up to a cap, and drops
//! straight back to base after the first unthrottled success. Plain failures
//! leave the interval where it is.

use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Interval under normal load (default: 3 s).
    pub base: Duration,
    /// Upper bound for self-imposed backoff (default: 60 s).
    pub cap: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(60),
        }
    }
}

/// What the last poll attempt told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSignal {
    /// A snapshot arrived without throttling.
    Success,
    /// The server answered "too many requests".
    RateLimited {
        /// Server hint, if one was sent.
        retry_after: Option<Duration>,
    },
    /// Network or server failure unrelated to throttling.
    Failed,
}

/// Client-side backoff state machine.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    config: GovernorConfig,
    current: Duration,
}

impl RateGovernor {
    /// Create a governor at its base interval.
    #[must_use]
    pub fn new(config: GovernorConfig) -> Self {
        let config = GovernorConfig {
            base: config.base,
            cap: config.cap.max(config.base),
        };
        Self {
            current: config.base,
            config,
        }
    }

    /// Delay before the next request.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.current
    }

    /// Whether the governor is currently backing off.
    #[must_use]
    pub fn is_backing_off(&self) -> bool {
        self.current > self.config.base
    }

    /// Feed the outcome of a request, returning the next delay.
    pub fn observe(&mut self, signal: PollSignal) -> Duration {
        match signal {
            PollSignal::Success => self.reset(),
            PollSignal::RateLimited { retry_after } => {
                let doubled = self.current.saturating_mul(2).min(self.config.cap);
                // The server's hint wins when it asks for more patience.
                self.current = retry_after.map_or(doubled, |hint| doubled.max(hint));
            }
            PollSignal::Failed => {}
        }
        self.current
    }

    /// Return to the base interval.
    pub const fn reset(&mut self) {
        self.current = self.config.base;
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}
