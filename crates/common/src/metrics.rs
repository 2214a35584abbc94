//! Metrics collection for Pollivu.
//!
//! Process-local counters for vote outcomes, storage retries, snapshot cache
//! efficiency and rate limiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Application metrics collector.
#[derive(Debug)]
pub struct Metrics {
    // === Request Metrics ===
    /// Total HTTP requests received
    pub http_requests_total: AtomicU64,
    /// HTTP requests answered with 4xx
    pub http_requests_4xx: AtomicU64,
    /// HTTP requests answered with 5xx
    pub http_requests_5xx: AtomicU64,
    /// Total request latency in microseconds
    pub http_request_latency_us_total: AtomicU64,
    /// Requests rejected by the rate limiter
    pub rate_limited_total: AtomicU64,

    // === Ledger Metrics ===
    /// Fresh votes recorded
    pub votes_cast: AtomicU64,
    /// Votes moved to another option
    pub votes_changed: AtomicU64,
    /// Casts rejected (already voted, closed, expired, invalid option)
    pub votes_rejected: AtomicU64,
    /// Transient storage conflicts retried
    pub storage_conflicts_retried: AtomicU64,
    /// Casts that failed after exhausting retries
    pub storage_conflicts_exhausted: AtomicU64,

    // === Snapshot Metrics ===
    /// Snapshot cache hits
    pub snapshot_cache_hits: AtomicU64,
    /// Snapshot cache misses (backing reads)
    pub snapshot_cache_misses: AtomicU64,

    // === Poll Metrics ===
    /// Polls created
    pub polls_created: AtomicU64,
    /// Polls deleted, explicitly or by expiry sweep
    pub polls_deleted: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            http_requests_total: AtomicU64::new(0),
            http_requests_4xx: AtomicU64::new(0),
            http_requests_5xx: AtomicU64::new(0),
            http_request_latency_us_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),

            votes_cast: AtomicU64::new(0),
            votes_changed: AtomicU64::new(0),
            votes_rejected: AtomicU64::new(0),
            storage_conflicts_retried: AtomicU64::new(0),
            storage_conflicts_exhausted: AtomicU64::new(0),

            snapshot_cache_hits: AtomicU64::new(0),
            snapshot_cache_misses: AtomicU64::new(0),

            polls_created: AtomicU64::new(0),
            polls_deleted: AtomicU64::new(0),
        }
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, status_code: u16, latency: Duration) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);

        match status_code {
            400..=499 => self.http_requests_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.http_requests_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };

        self.http_request_latency_us_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a rate limit rejection.
    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a snapshot cache hit/miss.
    pub fn record_cache_access(&self, hit: bool) {
        if hit {
            self.snapshot_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_requests_4xx: self.http_requests_4xx.load(Ordering::Relaxed),
            http_requests_5xx: self.http_requests_5xx.load(Ordering::Relaxed),
            http_request_latency_avg_us: self.average_latency_us(),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),

            votes_cast: self.votes_cast.load(Ordering::Relaxed),
            votes_changed: self.votes_changed.load(Ordering::Relaxed),
            votes_rejected: self.votes_rejected.load(Ordering::Relaxed),
            storage_conflicts_retried: self.storage_conflicts_retried.load(Ordering::Relaxed),
            storage_conflicts_exhausted: self
                .storage_conflicts_exhausted
                .load(Ordering::Relaxed),

            snapshot_cache_hit_rate: self.cache_hit_rate(),

            polls_created: self.polls_created.load(Ordering::Relaxed),
            polls_deleted: self.polls_deleted.load(Ordering::Relaxed),
        }
    }

    /// Calculate average HTTP request latency.
    fn average_latency_us(&self) -> u64 {
        let total = self.http_request_latency_us_total.load(Ordering::Relaxed);
        let count = self.http_requests_total.load(Ordering::Relaxed);
        if count > 0 { total / count } else { 0 }
    }

    /// Calculate cache hit rate.
    fn cache_hit_rate(&self) -> f64 {
        let hits = self.snapshot_cache_hits.load(Ordering::Relaxed);
        let misses = self.snapshot_cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let counters: [(&str, &str, u64); 10] = [
            ("http_requests_total", "Total HTTP requests", snapshot.http_requests_total),
            ("rate_limited_total", "Requests rejected by the rate limiter", snapshot.rate_limited_total),
            ("votes_cast_total", "Fresh votes recorded", snapshot.votes_cast),
            ("votes_changed_total", "Votes moved to another option", snapshot.votes_changed),
            ("votes_rejected_total", "Vote casts rejected", snapshot.votes_rejected),
            ("storage_conflicts_retried_total", "Transient storage conflicts retried", snapshot.storage_conflicts_retried),
            ("storage_conflicts_exhausted_total", "Casts failed after retries", snapshot.storage_conflicts_exhausted),
            ("polls_created_total", "Polls created", snapshot.polls_created),
            ("polls_deleted_total", "Polls deleted", snapshot.polls_deleted),
            ("http_requests_5xx_total", "HTTP requests answered with 5xx", snapshot.http_requests_5xx),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP pollivu_{name} {help}\n"));
            output.push_str(&format!("# TYPE pollivu_{name} counter\n"));
            output.push_str(&format!("pollivu_{name} {value}\n"));
        }

        output.push_str("# HELP pollivu_snapshot_cache_hit_rate Snapshot cache hit rate\n");
        output.push_str("# TYPE pollivu_snapshot_cache_hit_rate gauge\n");
        output.push_str(&format!(
            "pollivu_snapshot_cache_hit_rate {:.4}\n",
            snapshot.snapshot_cache_hit_rate
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    // HTTP
    pub http_requests_total: u64,
    pub http_requests_4xx: u64,
    pub http_requests_5xx: u64,
    pub http_request_latency_avg_us: u64,
    pub rate_limited_total: u64,

    // Ledger
    pub votes_cast: u64,
    pub votes_changed: u64,
    pub votes_rejected: u64,
    pub storage_conflicts_retried: u64,
    pub storage_conflicts_exhausted: u64,

    // Snapshots
    pub snapshot_cache_hit_rate: f64,

    // Polls
    pub polls_created: u64,
    pub polls_deleted: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
