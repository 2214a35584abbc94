//! Change notification for polling clients.
//!
//! Clients poll [`ChangeNotifier::snapshot`] on every tick. Reads go through a
//! short-lived cache and concurrent misses for the same poll within this
//! process share one backing read.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pollivu_common::{
    AppError, AppResult, OptionCount, PollSnapshot, ResultAggregator, get_metrics,
    is_valid_poll_id,
};
use pollivu_db::{PollStore, PollWithOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cache::SnapshotCache;

type FlightLock = Arc<Mutex<()>>;

/// Serves poll snapshots and keeps the snapshot cache honest.
#[derive(Clone)]
pub struct ChangeNotifier {
    store: Arc<dyn PollStore>,
    cache: Arc<dyn SnapshotCache>,
    flights: Arc<Mutex<HashMap<String, FlightLock>>>,
}

impl ChangeNotifier {
    /// Create a notifier over `store`, caching through `cache`.
    #[must_use]
    pub fn new(store: Arc<dyn PollStore>, cache: Arc<dyn SnapshotCache>) -> Self {
        Self {
            store,
            cache,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current snapshot of a poll.
    pub async fn snapshot(&self, poll_id: &str) -> AppResult<PollSnapshot> {
        if !is_valid_poll_id(poll_id) {
            return Err(AppError::PollNotFound(poll_id.to_string()));
        }

        if let Some(snapshot) = self.cached(poll_id).await {
            return Ok(snapshot);
        }

        let flight = self.flight(poll_id).await;
        let result = {
            let _guard = flight.lock().await;
            // Another request may have filled the cache while we waited.
            match self.cached(poll_id).await {
                Some(snapshot) => Ok(snapshot),
                None => self.load(poll_id).await,
            }
        };
        self.land(poll_id, flight).await;
        result
    }

    /// Drop the cached snapshot after a committed mutation.
    ///
    /// Waits for an in-flight load of the same poll so a pre-commit read
    /// cannot be cached after the invalidation.
    pub async fn invalidate(&self, poll_id: &str) {
        let flight = self.flight(poll_id).await;
        {
            let _guard = flight.lock().await;
            if let Err(e) = self.cache.invalidate(poll_id).await {
                warn!(poll_id = %poll_id, error = %e, "Failed to invalidate snapshot cache");
            }
        }
        self.land(poll_id, flight).await;
    }

    async fn cached(&self, poll_id: &str) -> Option<PollSnapshot> {
        match self.cache.get(poll_id).await {
            Ok(Some(snapshot)) => {
                get_metrics().record_cache_access(true);
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(poll_id = %poll_id, error = %e, "Snapshot cache read failed");
                None
            }
        }
    }

    async fn load(&self, poll_id: &str) -> AppResult<PollSnapshot> {
        get_metrics().record_cache_access(false);

        let view = self
            .store
            .find_poll(poll_id)
            .await?
            .ok_or_else(|| AppError::PollNotFound(poll_id.to_string()))?;
        let snapshot = build_snapshot(&view, Utc::now());

        if let Err(e) = self.cache.put(&snapshot).await {
            warn!(poll_id = %poll_id, error = %e, "Snapshot cache write failed");
        }
        debug!(poll_id = %poll_id, version = snapshot.version, "Loaded snapshot");
        Ok(snapshot)
    }

    async fn flight(&self, poll_id: &str) -> FlightLock {
        self.flights
            .lock()
            .await
            .entry(poll_id.to_string())
            .or_default()
            .clone()
    }

    async fn land(&self, poll_id: &str, flight: FlightLock) {
        let mut flights = self.flights.lock().await;
        // One reference in the map plus ours means nobody else is waiting.
        if Arc::strong_count(&flight) <= 2 {
            flights.remove(poll_id);
        }
    }
}

/// Build a snapshot from a consistent store read.
#[must_use]
pub fn build_snapshot(view: &PollWithOptions, now: DateTime<Utc>) -> PollSnapshot {
    let counts: Vec<OptionCount> = view
        .options
        .iter()
        .map(|o| OptionCount {
            option_id: o.id.clone(),
            votes: o.vote_count,
        })
        .collect();
    let tally = ResultAggregator::aggregate(&counts);
    let poll = &view.poll;

    PollSnapshot {
        poll_id: poll.id.clone(),
        version: poll.version,
        updated_at: poll.updated_at,
        total_votes: tally.total_votes,
        is_active: poll.is_active_at(now),
        is_closed: poll.is_closed,
        is_expired: poll.is_expired_at(now),
        is_public: poll.is_public,
        expires_at: poll.expires_at,
        results: tally.results,
    }
}
