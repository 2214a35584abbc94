//! Snapshot polling loop.
//!
//! A [`SnapshotWatcher`] fetches a poll's snapshot on the cadence chosen by a
//! [`RateGovernor`], classifies every result against the last one it saw and
//! reports it over an mpsc channel. Failures never discard the last known
//! snapshot; the watcher keeps retrying until stopped or the poll is gone.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pollivu_common::{PollSnapshot, SnapshotChange};
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::governor::{GovernorConfig, PollSignal, RateGovernor};

/// Error type for snapshot fetches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Poll not found")]
    NotFound,
    #[error("Snapshot fetch failed: {0}")]
    Transient(String),
}

impl FetchError {
    const fn signal(&self) -> PollSignal {
        match self {
            Self::RateLimited { retry_after } => PollSignal::RateLimited {
                retry_after: *retry_after,
            },
            Self::NotFound | Self::Transient(_) => PollSignal::Failed,
        }
    }
}

/// Where snapshots come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, poll_id: &str) -> Result<PollSnapshot, FetchError>;
}

/// Snapshot source over the HTTP API.
#[derive(Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    base_url: Url,
}

impl HttpSnapshotSource {
    /// Create a source against the server at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|e| FetchError::Transient(e.to_string()))?;
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("pollivu-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn snapshot_url(&self, poll_id: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::Transient("base URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["api", "polls", poll_id, "snapshot"]);
        Ok(url)
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, poll_id: &str) -> Result<PollSnapshot, FetchError> {
        let url = self.snapshot_url(poll_id)?;
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<PollSnapshot>()
                .await
                .map_err(|e| FetchError::Transient(e.to_string())),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(FetchError::RateLimited { retry_after })
            }
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status => Err(FetchError::Transient(format!("server answered {status}"))),
        }
    }
}

/// What the watcher reports.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A snapshot arrived. `change` is `None` for the first one.
    Snapshot {
        snapshot: PollSnapshot,
        change: Option<SnapshotChange>,
    },
    /// The server throttled us; the next attempt waits `retry_in`.
    Throttled { retry_in: Duration },
    /// A fetch failed; `last_known` is still the best view of the poll.
    Failed {
        message: String,
        last_known: Option<PollSnapshot>,
    },
    /// The poll no longer exists. The watcher stops after this event.
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Stopped,
}

/// Handle to a running watcher.
pub struct WatcherHandle {
    control: watch::Sender<Control>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop fetching until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.control.send_replace(Control::Paused);
    }

    /// Fetch again right away, restarting at the base interval.
    pub fn resume(&self) {
        self.control.send_replace(Control::Running);
    }

    /// Stop the watcher and wait for it to finish.
    pub async fn stop(self) {
        self.control.send_replace(Control::Stopped);
        // A watcher blocked on a full event channel would never see the flag.
        self.task.abort();
        match self.task.await {
            Err(e) if !e.is_cancelled() => {
                warn!(error = %e, "Snapshot watcher ended abnormally");
            }
            _ => {}
        }
    }

    /// Whether the watcher task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Polls one poll's snapshot and emits classified updates.
pub struct SnapshotWatcher<S> {
    source: Arc<S>,
    poll_id: String,
    governor: RateGovernor,
    last: Option<PollSnapshot>,
}

impl<S: SnapshotSource + 'static> SnapshotWatcher<S> {
    /// Create a watcher for `poll_id`.
    pub fn new(source: Arc<S>, poll_id: impl Into<String>, config: GovernorConfig) -> Self {
        Self {
            source,
            poll_id: poll_id.into(),
            governor: RateGovernor::new(config),
            last: None,
        }
    }

    /// Start polling on a background task.
    #[must_use]
    pub fn spawn(self, buffer: usize) -> (WatcherHandle, mpsc::Receiver<WatchEvent>) {
        let (events, rx) = mpsc::channel(buffer.max(1));
        let (control, control_rx) = watch::channel(Control::Running);
        let task = tokio::spawn(self.run(events, control_rx));
        (WatcherHandle { control, task }, rx)
    }

    async fn run(mut self, events: mpsc::Sender<WatchEvent>, mut control: watch::Receiver<Control>) {
        loop {
            let state = *control.borrow_and_update();
            match state {
                Control::Stopped => break,
                Control::Paused => {
                    if control.changed().await.is_err() {
                        break;
                    }
                    if *control.borrow() == Control::Running {
                        self.governor.reset();
                    }
                    continue;
                }
                Control::Running => {}
            }

            let event = self.tick().await;
            let gone = event == WatchEvent::Gone;
            if events.send(event).await.is_err() || gone {
                break;
            }

            tokio::select! {
                () = tokio::time::sleep(self.governor.interval()) => {}
                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Loop top acts on the new state; a resume fetches now.
                    if *control.borrow() == Control::Running {
                        self.governor.reset();
                    }
                }
            }
        }
        debug!(poll_id = %self.poll_id, "Snapshot watcher stopped");
    }

    async fn tick(&mut self) -> WatchEvent {
        match self.source.fetch(&self.poll_id).await {
            Ok(snapshot) => {
                self.governor.observe(PollSignal::Success);
                let change = self
                    .last
                    .as_ref()
                    .map(|prev| SnapshotChange::between(prev, &snapshot));
                self.last = Some(snapshot.clone());
                WatchEvent::Snapshot { snapshot, change }
            }
            Err(FetchError::NotFound) => WatchEvent::Gone,
            Err(e) => {
                let next = self.governor.observe(e.signal());
                match e {
                    FetchError::RateLimited { .. } => {
                        debug!(poll_id = %self.poll_id, retry_in = ?next, "Snapshot polling throttled");
                        WatchEvent::Throttled { retry_in: next }
                    }
                    other => {
                        warn!(poll_id = %self.poll_id, error = %other, "Snapshot fetch failed");
                        WatchEvent::Failed {
                            message: other.to_string(),
                            last_known: self.last.clone(),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pollivu_common::OptionResult;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn snapshot(version: i64, red: i64, blue: i64) -> PollSnapshot {
        let total = red + blue;
        let pct = |v: i64| if total == 0 { 0.0 } else { v as f64 * 100.0 / total as f64 };
        PollSnapshot {
            poll_id: "watchedpoll".to_string(),
            version,
            updated_at: Utc.timestamp_opt(1_700_000_000 + version, 0).unwrap(),
            total_votes: total,
            is_active: true,
            is_closed: false,
            is_expired: false,
            is_public: true,
            expires_at: None,
            results: vec![
                OptionResult {
                    option_id: "red".to_string(),
                    votes: red,
                    percentage: pct(red),
                },
                OptionResult {
                    option_id: "blue".to_string(),
                    votes: blue,
                    percentage: pct(blue),
                },
            ],
        }
    }

    /// Replays scripted responses and records when each fetch happened.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<PollSnapshot, FetchError>>>,
        fallback: PollSnapshot,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<PollSnapshot, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback: snapshot(1, 0, 0),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self, _poll_id: &str) -> Result<PollSnapshot, FetchError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn config() -> GovernorConfig {
        GovernorConfig {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifies_each_snapshot() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(1, 0, 0)),
            Ok(snapshot(1, 0, 0)),
            Ok(snapshot(2, 0, 1)),
        ]);
        let (handle, mut rx) = SnapshotWatcher::new(source.clone(), "watchedpoll", config()).spawn(8);

        let changes: Vec<Option<SnapshotChange>> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| match e {
            WatchEvent::Snapshot { change, .. } => change,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();

        assert_eq!(
            changes,
            vec![
                None,
                Some(SnapshotChange::Unchanged),
                Some(SnapshotChange::CountsChanged)
            ]
        );
        assert_eq!(source.gaps(), vec![Duration::from_secs(3); 2]);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_on_rate_limit_and_resets() {
        let limited = || Err(FetchError::RateLimited { retry_after: None });
        let source = ScriptedSource::new(vec![
            Ok(snapshot(1, 0, 0)),
            limited(),
            limited(),
            Ok(snapshot(1, 0, 0)),
            Ok(snapshot(1, 0, 0)),
        ]);
        let (handle, mut rx) = SnapshotWatcher::new(source.clone(), "watchedpoll", config()).spawn(8);

        for _ in 0..5 {
            rx.recv().await.unwrap();
        }
        // Two throttles double the delay twice, one success restores base.
        assert_eq!(
            source.gaps(),
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12),
                Duration::from_secs(3),
            ]
        );
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_known_state() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(4, 2, 2)),
            Err(FetchError::Transient("connection reset".to_string())),
        ]);
        let (handle, mut rx) = SnapshotWatcher::new(source.clone(), "watchedpoll", config()).spawn(8);

        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            WatchEvent::Failed { last_known, .. } => {
                assert_eq!(last_known, Some(snapshot(4, 2, 2)));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Failure leaves the cadence at base and polling continues.
        rx.recv().await.unwrap();
        assert_eq!(source.gaps(), vec![Duration::from_secs(3); 2]);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_poll_ends_watch() {
        let source = ScriptedSource::new(vec![Ok(snapshot(1, 0, 0)), Err(FetchError::NotFound)]);
        let (handle, mut rx) = SnapshotWatcher::new(source, "watchedpoll", config()).spawn(8);

        rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), WatchEvent::Gone);
        assert!(rx.recv().await.is_none());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let limited = || Err(FetchError::RateLimited { retry_after: None });
        let source = ScriptedSource::new(vec![limited(), limited()]);
        let (handle, mut rx) = SnapshotWatcher::new(source.clone(), "watchedpoll", config()).spawn(8);

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        handle.pause();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.call_count(), 2);

        handle.resume();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        let gaps = source.gaps();
        // Resume fetches at once and continues at base despite prior backoff.
        assert_eq!(gaps.last(), Some(&Duration::from_secs(3)));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let source = ScriptedSource::new(vec![]);
        let (handle, mut rx) = SnapshotWatcher::new(source, "watchedpoll", config()).spawn(1);

        rx.recv().await.unwrap();
        handle.stop().await;
        while rx.recv().await.is_some() {}
    }

    #[test]
    fn test_snapshot_url() {
        let source = HttpSnapshotSource::new("http://localhost:3000/").unwrap();
        assert_eq!(
            source.snapshot_url("abcDEF123_-x").unwrap().as_str(),
            "http://localhost:3000/api/polls/abcDEF123_-x/snapshot"
        );
    }
}
