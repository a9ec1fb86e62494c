//! Topic fan-out of session snapshots.
//!
//! Every event carries the full snapshot, so delivery only has to be
//! at-least-once: a subscriber that misses events is consistent again after
//! the next one it receives. Each subscriber gets a bounded queue. Publishing
//! never waits; a subscriber whose queue is full is dropped from push delivery
//! and its [`Subscription`] switches to pulling snapshots from the source.
//!
//! # Usage
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(DispatcherConfig::default());
//! let mut subscription = session.subscribe();
//!
//! loop {
//!     let delivery = subscription.next().await;
//!     render(delivery.snapshot());
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::TrackingConfig;
use crate::geo::Coordinate;
use crate::model::{PositionSample, Route, ScheduleId, SessionStatus, Site, SiteId, SiteStatus, VisitSequence};

/// Full state of one tracking session; enough to render without history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schedule_id: ScheduleId,
    pub status: SessionStatus,
    pub position: Option<PositionSample>,
    pub sites: Vec<Site>,
    pub sequence: VisitSequence,
    /// Bumped every time the sequence is recomputed.
    pub sequence_revision: u64,
    pub route: Option<Route>,
    pub completed_count: usize,
    pub total_count: usize,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn site(&self, id: &SiteId) -> Option<&Site> {
        self.sites.iter().find(|site| &site.id == id)
    }

    pub fn site_status(&self, id: &SiteId) -> Option<SiteStatus> {
        self.site(id).map(|site| site.status)
    }

    pub fn position_coordinate(&self) -> Option<Coordinate> {
        self.position.as_ref().map(|sample| sample.coordinate)
    }

    /// Route is a straight-line estimate and should be shown as such.
    pub fn route_is_estimate(&self) -> bool {
        self.route.as_ref().is_some_and(|route| route.is_estimate_fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    PositionUpdated,
    SiteStatusChanged { site_id: SiteId, status: SiteStatus },
    SiteCompleted { site_id: SiteId },
    RouteUpdated,
    SitesRefreshed,
    SessionStatusChanged { status: SessionStatus },
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub kind: EventKind,
    pub snapshot: Snapshot,
}

impl TrackingEvent {
    pub fn new(kind: EventKind, snapshot: Snapshot) -> Self {
        Self { kind, snapshot }
    }
}

/// Anything that can answer "what is the current state" on demand.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub heartbeat_window: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            heartbeat_window: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl From<&TrackingConfig> for DispatcherConfig {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            queue_capacity: config.subscriber_queue_capacity,
            heartbeat_window: config.heartbeat_window(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers removed from push delivery because their queue was full.
    pub dropped_stale: usize,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<TrackingEvent>,
}

struct DispatcherInner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    config: DispatcherConfig,
}

/// Cheap to clone; all clones share the same topics.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Registers a push subscriber on `topic`; `source` backs the poll fallback.
    pub fn subscribe(&self, topic: &str, source: Arc<dyn SnapshotSource>) -> Subscription {
        let config = &self.inner.config;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.topics()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        tracing::debug!(topic, subscriber = id, "Subscriber registered");

        Subscription {
            id,
            topic: topic.to_string(),
            rx: Some(rx),
            source,
            heartbeat_window: config.heartbeat_window,
            poll_interval: config.poll_interval,
        }
    }

    /// Fire-and-forget fan-out to every push subscriber of `topic`.
    pub fn publish(&self, topic: &str, event: TrackingEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let mut topics = self.topics();
        let Some(subscribers) = topics.get_mut(topic) else {
            return report;
        };

        subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                report.dropped_stale += 1;
                tracing::warn!(
                    topic,
                    subscriber = subscriber.id,
                    "Subscriber queue full, dropping it from push delivery"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            topics.remove(topic);
        }

        report
    }

    /// Number of live push subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics()
            .get(topic)
            .map(|subscribers| subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

/// How a snapshot reached the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Pushed(TrackingEvent),
    /// Pulled from the source after a missed heartbeat or loss of push.
    Polled(Snapshot),
}

impl Delivery {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            Delivery::Pushed(event) => &event.snapshot,
            Delivery::Polled(snapshot) => snapshot,
        }
    }

    pub fn into_snapshot(self) -> Snapshot {
        match self {
            Delivery::Pushed(event) => event.snapshot,
            Delivery::Polled(snapshot) => snapshot,
        }
    }

    pub fn event_kind(&self) -> Option<&EventKind> {
        match self {
            Delivery::Pushed(event) => Some(&event.kind),
            Delivery::Polled(_) => None,
        }
    }
}

/// Receiving end of a topic.
pub struct Subscription {
    id: u64,
    topic: String,
    rx: Option<mpsc::Receiver<TrackingEvent>>,
    source: Arc<dyn SnapshotSource>,
    heartbeat_window: Duration,
    poll_interval: Duration,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// False once the dispatcher dropped this subscriber.
    pub fn is_push_active(&self) -> bool {
        self.rx.is_some()
    }

    /// Next pushed event, or a pulled snapshot when nothing arrived within
    /// the heartbeat window. After push delivery is lost it polls every
    /// `poll_interval`.
    pub async fn next(&mut self) -> Delivery {
        if let Some(rx) = self.rx.as_mut() {
            let received = tokio::time::timeout(self.heartbeat_window, rx.recv()).await;
            match received {
                Ok(Some(event)) => return Delivery::Pushed(event),
                Ok(None) => {
                    tracing::info!(
                        topic = %self.topic,
                        subscriber = self.id,
                        "Push delivery closed, falling back to polling"
                    );
                    self.rx = None;
                }
                Err(_) => {
                    tracing::debug!(
                        topic = %self.topic,
                        subscriber = self.id,
                        "No heartbeat within window, polling snapshot"
                    );
                }
            }
            return Delivery::Polled(self.source.snapshot());
        }

        tokio::time::sleep(self.poll_interval).await;
        Delivery::Polled(self.source.snapshot())
    }

    /// Pulls the current snapshot right away.
    pub fn poll_now(&self) -> Snapshot {
        self.source.snapshot()
    }

    /// Pushed event if one is already queued.
    pub fn try_next(&mut self) -> Option<TrackingEvent> {
        self.rx.as_mut()?.try_recv().ok()
    }
}
