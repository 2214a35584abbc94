//! Short-lived snapshot caches.
//!
//! A cache entry is only ever a copy of what the store returned; nothing
//! reads it to decide whether a vote may be written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::KeysInterface;
use fred::types::Expiration;
use pollivu_common::{AppError, AppResult, PollSnapshot};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Read-through cache for poll snapshots.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Cached snapshot for `poll_id`, if one is still fresh.
    async fn get(&self, poll_id: &str) -> AppResult<Option<PollSnapshot>>;

    /// Store a freshly loaded snapshot.
    async fn put(&self, snapshot: &PollSnapshot) -> AppResult<()>;

    /// Drop the cached snapshot for `poll_id`.
    async fn invalidate(&self, poll_id: &str) -> AppResult<()>;
}

/// Per-process snapshot cache.
#[derive(Clone)]
pub struct MemorySnapshotCache {
    entries: Arc<RwLock<HashMap<String, (Instant, PollSnapshot)>>>,
    ttl: Duration,
}

impl MemorySnapshotCache {
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Drop every expired entry.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        before - entries.len()
    }
}

#[async_trait]
impl SnapshotCache for MemorySnapshotCache {
    async fn get(&self, poll_id: &str) -> AppResult<Option<PollSnapshot>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(poll_id)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn put(&self, snapshot: &PollSnapshot) -> AppResult<()> {
        if self.ttl.is_zero() {
            return Ok(());
        }
        self.entries
            .write()
            .await
            .insert(snapshot.poll_id.clone(), (Instant::now(), snapshot.clone()));
        Ok(())
    }

    async fn invalidate(&self, poll_id: &str) -> AppResult<()> {
        self.entries.write().await.remove(poll_id);
        Ok(())
    }
}

/// Snapshot cache shared by every worker through Redis.
#[derive(Clone)]
pub struct RedisSnapshotCache {
    redis: Arc<RedisClient>,
    prefix: String,
    ttl_secs: i64,
}

impl RedisSnapshotCache {
    /// Create a Redis-backed cache. Keys are namespaced under `prefix`.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            ttl_secs: ttl.as_secs().max(1) as i64,
        }
    }

    fn key(&self, poll_id: &str) -> String {
        format!("{}:snapshot:{poll_id}", self.prefix)
    }
}

#[async_trait]
impl SnapshotCache for RedisSnapshotCache {
    async fn get(&self, poll_id: &str) -> AppResult<Option<PollSnapshot>> {
        let raw: Option<String> = self
            .redis
            .get(self.key(poll_id))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        match raw {
            Some(json) => {
                let snapshot = serde_json::from_str(&json)
                    .map_err(|e| AppError::Redis(format!("corrupt snapshot entry: {e}")))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, snapshot: &PollSnapshot) -> AppResult<()> {
        let json =
            serde_json::to_string(snapshot).map_err(|e| AppError::Internal(e.to_string()))?;

        self.redis
            .set::<(), _, _>(
                self.key(&snapshot.poll_id),
                json,
                Some(Expiration::EX(self.ttl_secs)),
                None,
                false,
            )
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        debug!(poll_id = %snapshot.poll_id, version = snapshot.version, "Cached snapshot");
        Ok(())
    }

    async fn invalidate(&self, poll_id: &str) -> AppResult<()> {
        self.redis
            .del::<(), _>(self.key(poll_id))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(())
    }
}
