//! Tracking session - the single owner of one schedule's live state.
//!
//! All mutation happens under one lock, so concurrent calls on the same
//! session are linearised. Position ingestion never waits on the network:
//! the decision to recompute the route is taken synchronously, the provider
//! call runs as a spawned task and its result is applied back through the
//! same lock once it arrives (or dropped if the session moved on meanwhile).
//!
//! Flow of one sample:
//!
//! 1. Proximity check against pending sites; an arrival completes the site
//!    and re-sequences the remaining ones from the arrived site.
//! 2. Recalculation policy plus throttle decide whether to request a route.
//! 3. A snapshot is published to subscribers either way.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{RouteCache, RouteCacheConfig};
use crate::config::TrackingConfig;
use crate::dispatch::{
    Dispatcher, DispatcherConfig, EventKind, PublishReport, Snapshot, SnapshotSource, Subscription,
    TrackingEvent,
};
use crate::error::TrackingError;
use crate::geo::{Coordinate, haversine_km};
use crate::model::{
    OriginKind, PositionSample, Route, Schedule, ScheduleId, SessionStatus, Site, SiteId, SiteKind,
    SiteStatus, VisitSequence,
};
use crate::policy::{RecalculationPolicy, RecalculationThrottle};
use crate::proximity::ProximityDetector;
use crate::sequence;
use crate::traits::{RouteProvider, SiteStore};

/// Collaborators shared by every session of one process.
pub struct SessionContext<P> {
    pub provider: Arc<P>,
    pub cache: Arc<RouteCache>,
    pub dispatcher: Dispatcher,
    pub config: TrackingConfig,
}

impl<P> Clone for SessionContext<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            cache: Arc::clone(&self.cache),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P> SessionContext<P> {
    /// In-memory cache and a fresh dispatcher, both sized from `config`.
    pub fn new(provider: Arc<P>, config: TrackingConfig) -> Self {
        Self {
            provider,
            cache: Arc::new(RouteCache::in_memory(RouteCacheConfig::from(&config))),
            dispatcher: Dispatcher::new(DispatcherConfig::from(&config)),
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<RouteCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}

/// Handle to one tracking session. Clones share the same state.
pub struct TrackingSession<P> {
    inner: Arc<SessionInner<P>>,
}

impl<P> Clone for TrackingSession<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<P> {
    schedule_id: ScheduleId,
    state: Mutex<SessionState>,
    provider: Arc<P>,
    cache: Arc<RouteCache>,
    dispatcher: Dispatcher,
    store: Option<Arc<dyn SiteStore>>,
    runtime: Handle,
    config: TrackingConfig,
    policy: RecalculationPolicy,
    detector: ProximityDetector,
}

struct SessionState {
    status: SessionStatus,
    sites: Vec<Site>,
    latest: Option<PositionSample>,
    previous: Option<PositionSample>,
    sequence: VisitSequence,
    sequence_revision: u64,
    route: Option<Route>,
    /// Origin the most recent route request was issued from.
    route_anchor: Option<Coordinate>,
    throttle: RecalculationThrottle,
    /// Sequence changed since the last request; recompute even without movement.
    recalculation_pending: bool,
    next_request_id: u64,
    applied_request_id: u64,
    /// Bumped on finish/cancel so late results cannot land.
    epoch: u64,
    in_flight: Option<JoinHandle<()>>,
}

struct RouteRequest {
    id: u64,
    epoch: u64,
    origin: Coordinate,
    origin_kind: OriginKind,
    sequence_revision: u64,
    waypoints: Vec<Coordinate>,
}

impl<P: RouteProvider + 'static> TrackingSession<P> {
    /// Creates an inactive session for `schedule`.
    ///
    /// Must be called from within a tokio runtime; route recomputation is
    /// spawned onto it.
    pub fn new(schedule: Schedule, context: &SessionContext<P>) -> Result<Self, TrackingError> {
        Self::build(schedule, None, context)
    }

    /// Reads the schedule from `store` and keeps the store for completion
    /// writes and [`TrackingSession::refresh_sites`].
    pub fn load(
        schedule_id: &ScheduleId,
        store: Arc<dyn SiteStore>,
        context: &SessionContext<P>,
    ) -> Result<Self, TrackingError> {
        let schedule = store.load_schedule(schedule_id)?;
        Self::build(schedule, Some(store), context)
    }

    fn build(
        schedule: Schedule,
        store: Option<Arc<dyn SiteStore>>,
        context: &SessionContext<P>,
    ) -> Result<Self, TrackingError> {
        schedule.validate()?;
        let runtime = Handle::try_current().map_err(|_| TrackingError::RuntimeUnavailable)?;
        let config = context.config.clone();

        let state = SessionState {
            status: SessionStatus::Inactive,
            sites: schedule.sites,
            latest: None,
            previous: None,
            sequence: VisitSequence::default(),
            sequence_revision: 0,
            route: None,
            route_anchor: None,
            throttle: RecalculationThrottle::new(config.min_recalculation_interval()),
            recalculation_pending: false,
            next_request_id: 0,
            applied_request_id: 0,
            epoch: 0,
            in_flight: None,
        };

        Ok(Self {
            inner: Arc::new(SessionInner {
                schedule_id: schedule.id,
                state: Mutex::new(state),
                provider: Arc::clone(&context.provider),
                cache: Arc::clone(&context.cache),
                dispatcher: context.dispatcher.clone(),
                store,
                runtime,
                policy: RecalculationPolicy::new(config.recalculation_distance_km),
                detector: ProximityDetector::new(config.arrival_radius_km),
                config,
            }),
        })
    }

    pub fn schedule_id(&self) -> &ScheduleId {
        &self.inner.schedule_id
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock_state().status
    }

    /// Inactive -> Active. Builds the first sequence and requests a route
    /// from the vehicle fix or, lacking one, from the station.
    pub fn activate(&self) -> Result<Snapshot, TrackingError> {
        let inner = &self.inner;
        let snapshot = {
            let mut state = inner.lock_state();
            if state.status != SessionStatus::Inactive {
                return Err(TrackingError::InvalidTransition {
                    from: state.status,
                    to: SessionStatus::Active,
                });
            }

            state.status = SessionStatus::Active;
            let origin = inner.route_origin(&state).map(|(origin, _)| origin);
            inner.resequence(&mut state, origin);
            state.recalculation_pending = true;
            inner.recalculate_if_needed(&mut state, Instant::now());

            tracing::info!(
                schedule = %inner.schedule_id,
                sites = state.sequence.len(),
                "Tracking session activated"
            );
            inner.snapshot_of(&state)
        };

        inner.publish(
            EventKind::SessionStatusChanged {
                status: SessionStatus::Active,
            },
            snapshot.clone(),
        );
        Ok(snapshot)
    }

    /// Feeds one position sample through arrival detection and route upkeep.
    pub fn ingest_position(&self, sample: PositionSample) -> Result<Snapshot, TrackingError> {
        sample.validate()?;
        let inner = &self.inner;
        let now = Instant::now();

        let (snapshot, completed) = {
            let mut state = inner.lock_state();
            if state.status != SessionStatus::Active {
                return Err(TrackingError::SessionNotActive(state.status));
            }

            let position = sample.coordinate;
            let captured_at = sample.captured_at;
            state.previous = state.latest.replace(sample);
            if let Some(previous) = &state.previous {
                tracing::trace!(
                    schedule = %inner.schedule_id,
                    moved_km = haversine_km(previous.coordinate, position),
                    "Position sample"
                );
            }

            let mut completed = None;
            if let Some(site_id) = inner.detector.check_arrival(position, &state.sites) {
                if let Some(site_coordinate) = inner.complete_site(&mut state, &site_id, captured_at) {
                    inner.resequence(&mut state, Some(site_coordinate));
                    completed = Some((site_id, captured_at));
                }
            }

            inner.recalculate_if_needed(&mut state, now);
            (inner.snapshot_of(&state), completed)
        };

        if let Some((site_id, completed_at)) = completed {
            inner.record_completion(site_id.clone(), completed_at);
            inner.publish(EventKind::SiteCompleted { site_id }, snapshot.clone());
        }
        inner.publish(EventKind::PositionUpdated, snapshot.clone());
        Ok(snapshot)
    }

    /// Completion reported out of band (manual confirmation). Completing an
    /// already completed site is a no-op.
    pub fn mark_completed_externally(&self, site_id: &SiteId) -> Result<Snapshot, TrackingError> {
        let inner = &self.inner;
        let completed_at = Utc::now();

        let snapshot = {
            let mut state = inner.lock_state();
            if state.status != SessionStatus::Active {
                return Err(TrackingError::SessionNotActive(state.status));
            }

            let site = find_site(&state.sites, site_id)?;
            if site.is_station() {
                return Err(TrackingError::StationImmutable(site_id.clone()));
            }
            if site.status == SiteStatus::Completed {
                return Ok(inner.snapshot_of(&state));
            }

            let site_coordinate = inner.complete_site(&mut state, site_id, completed_at);
            let origin = state
                .latest
                .as_ref()
                .map(|sample| sample.coordinate)
                .or(site_coordinate);
            inner.resequence(&mut state, origin);
            inner.recalculate_if_needed(&mut state, Instant::now());
            inner.snapshot_of(&state)
        };

        inner.record_completion(site_id.clone(), completed_at);
        inner.publish(
            EventKind::SiteCompleted {
                site_id: site_id.clone(),
            },
            snapshot.clone(),
        );
        Ok(snapshot)
    }

    /// Driver started working on a pending site (Pending -> InProgress).
    pub fn start_task(&self, site_id: &SiteId) -> Result<Snapshot, TrackingError> {
        let inner = &self.inner;
        let snapshot = {
            let mut state = inner.lock_state();
            if state.status != SessionStatus::Active {
                return Err(TrackingError::SessionNotActive(state.status));
            }

            let site = find_site_mut(&mut state.sites, site_id)?;
            match (site.kind, site.status) {
                (SiteKind::Station, _) => {
                    return Err(TrackingError::StationImmutable(site_id.clone()));
                }
                (_, SiteStatus::Completed) => {
                    return Err(TrackingError::SiteAlreadyCompleted(site_id.clone()));
                }
                (_, SiteStatus::InProgress) => return Ok(inner.snapshot_of(&state)),
                (_, SiteStatus::Pending) => site.status = SiteStatus::InProgress,
            }

            tracing::info!(schedule = %inner.schedule_id, site = %site_id, "Task started");
            inner.snapshot_of(&state)
        };

        inner.publish(
            EventKind::SiteStatusChanged {
                site_id: site_id.clone(),
                status: SiteStatus::InProgress,
            },
            snapshot.clone(),
        );
        Ok(snapshot)
    }

    /// Re-reads the site list from the store. Completed sites stay completed;
    /// new sites join the sequence and removed ones leave it.
    pub fn refresh_sites(&self) -> Result<Snapshot, TrackingError> {
        let inner = &self.inner;
        let store = inner.store.as_ref().ok_or(TrackingError::NoSiteStore)?;
        let schedule = store.load_schedule(&inner.schedule_id)?;
        schedule.validate()?;

        let snapshot = {
            let mut state = inner.lock_state();
            if state.status.is_terminal() {
                return Err(TrackingError::SessionNotActive(state.status));
            }

            let merged: Vec<Site> = schedule
                .sites
                .into_iter()
                .map(|mut site| {
                    if let Some(local) = state.sites.iter().find(|local| local.id == site.id) {
                        if local.status == SiteStatus::Completed {
                            site.status = SiteStatus::Completed;
                            site.completed_at = local.completed_at;
                        } else if site.status == SiteStatus::Pending {
                            site.status = local.status;
                        }
                    }
                    site
                })
                .collect();
            state.sites = merged;

            let origin = inner.route_origin(&state).map(|(origin, _)| origin);
            inner.resequence(&mut state, origin);
            state.recalculation_pending = true;
            inner.recalculate_if_needed(&mut state, Instant::now());

            tracing::info!(
                schedule = %inner.schedule_id,
                sites = state.sites.len(),
                "Sites refreshed from store"
            );
            inner.snapshot_of(&state)
        };

        inner.publish(EventKind::SitesRefreshed, snapshot.clone());
        Ok(snapshot)
    }

    /// Active -> Completed.
    pub fn finish(&self) -> Result<Snapshot, TrackingError> {
        self.terminate(SessionStatus::Completed)
    }

    /// Inactive/Active -> Cancelled.
    pub fn cancel(&self) -> Result<Snapshot, TrackingError> {
        self.terminate(SessionStatus::Cancelled)
    }

    fn terminate(&self, to: SessionStatus) -> Result<Snapshot, TrackingError> {
        let inner = &self.inner;
        let snapshot = {
            let mut state = inner.lock_state();
            let allowed = match to {
                SessionStatus::Completed => state.status == SessionStatus::Active,
                _ => !state.status.is_terminal(),
            };
            if !allowed {
                return Err(TrackingError::InvalidTransition {
                    from: state.status,
                    to,
                });
            }

            state.status = to;
            state.epoch += 1;
            if let Some(handle) = state.in_flight.take() {
                handle.abort();
            }

            tracing::info!(schedule = %inner.schedule_id, status = ?to, "Tracking session ended");
            inner.snapshot_of(&state)
        };

        inner.publish(EventKind::SessionStatusChanged { status: to }, snapshot.clone());
        Ok(snapshot)
    }

    /// Current state; no side effects.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.current_snapshot()
    }

    /// Push subscription on this schedule's topic, polling this session as fallback.
    pub fn subscribe(&self) -> Subscription {
        let source: Arc<dyn SnapshotSource> = self.inner.clone();
        self.inner
            .dispatcher
            .subscribe(self.inner.schedule_id.as_str(), source)
    }

    /// Publishes a heartbeat carrying the current snapshot.
    pub fn heartbeat(&self) -> PublishReport {
        self.inner.publish(EventKind::Heartbeat, self.inner.current_snapshot())
    }

    /// Publishes heartbeats every `heartbeat_interval_secs` until the session ends.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = inner.config.heartbeat_interval().max(std::time::Duration::from_millis(1));

        self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = inner.current_snapshot();
                if snapshot.status.is_terminal() {
                    break;
                }
                if snapshot.status != SessionStatus::Active {
                    continue;
                }
                inner.publish(EventKind::Heartbeat, snapshot);
            }
        })
    }
}

impl<P: RouteProvider + 'static> SessionInner<P> {
    /// Requests a new route when the policy (or a sequence change) asks for
    /// one and the throttle allows it.
    fn recalculate_if_needed(self: &Arc<Self>, state: &mut SessionState, now: Instant) {
        if state.status != SessionStatus::Active {
            return;
        }
        let Some((origin, origin_kind)) = self.route_origin(state) else {
            return;
        };

        let needed = state.recalculation_pending
            || self
                .policy
                .should_recalculate(state.route.as_ref(), state.route_anchor, origin);
        if !needed {
            return;
        }
        if !state.throttle.try_acquire(now) {
            tracing::debug!(schedule = %self.schedule_id, "Route recalculation throttled");
            return;
        }

        state.recalculation_pending = false;
        state.route_anchor = Some(origin);
        state.next_request_id += 1;

        if state.sequence.is_empty() {
            // nothing left to visit; supersede anything still in flight
            state.applied_request_id = state.next_request_id;
            state.route = Some(Route::empty(origin_kind));
            tracing::debug!(schedule = %self.schedule_id, "No open sites, route cleared");
            return;
        }

        let mut waypoints = Vec::with_capacity(state.sequence.len() + 1);
        waypoints.push(origin);
        waypoints.extend(
            state
                .sequence
                .iter()
                .filter_map(|id| state.sites.iter().find(|site| &site.id == id))
                .map(|site| site.coordinate),
        );

        let request = RouteRequest {
            id: state.next_request_id,
            epoch: state.epoch,
            origin,
            origin_kind,
            sequence_revision: state.sequence_revision,
            waypoints,
        };

        tracing::debug!(
            schedule = %self.schedule_id,
            request = request.id,
            waypoints = request.waypoints.len(),
            origin = ?origin_kind,
            "Route recalculation requested"
        );

        let inner = Arc::clone(self);
        state.in_flight = Some(self.runtime.spawn(async move {
            let route = inner
                .cache
                .get_or_compute(&request.waypoints, inner.provider.as_ref())
                .await;
            inner.apply_route(request, route);
        }));
    }

    fn apply_route(&self, request: RouteRequest, route: Route) {
        let route = Route {
            origin_kind: request.origin_kind,
            ..route
        };

        let snapshot = {
            let mut state = self.lock_state();
            if request.epoch == state.epoch && request.id == state.next_request_id {
                state.in_flight = None;
            }

            if let Some(reason) = self.stale_reason(&state, &request) {
                tracing::debug!(
                    schedule = %self.schedule_id,
                    request = request.id,
                    reason,
                    "Discarding route result"
                );
                return;
            }

            if route.is_estimate_fallback {
                tracing::warn!(
                    schedule = %self.schedule_id,
                    distance_km = route.distance_km,
                    "Serving straight-line route estimate"
                );
            } else {
                tracing::info!(
                    schedule = %self.schedule_id,
                    distance_km = route.distance_km,
                    duration_minutes = route.duration_minutes,
                    "Route updated"
                );
            }

            state.applied_request_id = request.id;
            state.route = Some(route);
            self.snapshot_of(&state)
        };

        self.publish(EventKind::RouteUpdated, snapshot);
    }

    fn stale_reason(&self, state: &SessionState, request: &RouteRequest) -> Option<&'static str> {
        if request.epoch != state.epoch {
            return Some("session ended");
        }
        if state.status != SessionStatus::Active {
            return Some("session not active");
        }
        if request.id <= state.applied_request_id {
            return Some("newer route already applied");
        }
        if request.sequence_revision != state.sequence_revision {
            return Some("sequence changed");
        }
        if request.id < state.next_request_id {
            let moved = self
                .route_origin(state)
                .is_some_and(|(current, _)| self.policy.has_moved(request.origin, current));
            if moved {
                return Some("position moved since request");
            }
        }
        None
    }

    /// Latest vehicle fix, else the station.
    fn route_origin(&self, state: &SessionState) -> Option<(Coordinate, OriginKind)> {
        if let Some(sample) = &state.latest {
            return Some((sample.coordinate, OriginKind::DriverOrigin));
        }
        state
            .sites
            .iter()
            .find(|site| site.is_station())
            .map(|station| (station.coordinate, OriginKind::StationOrigin))
    }
}

impl<P> SessionInner<P> {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_snapshot(&self) -> Snapshot {
        let state = self.lock_state();
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &SessionState) -> Snapshot {
        let regular = state.sites.iter().filter(|site| !site.is_station());
        let (total_count, completed_count) = regular.fold((0, 0), |(total, done), site| {
            let done = done + usize::from(site.status == SiteStatus::Completed);
            (total + 1, done)
        });

        Snapshot {
            schedule_id: self.schedule_id.clone(),
            status: state.status,
            position: state.latest.clone(),
            sites: state.sites.clone(),
            sequence: state.sequence.clone(),
            sequence_revision: state.sequence_revision,
            route: state.route.clone(),
            completed_count,
            total_count,
            taken_at: Utc::now(),
        }
    }

    /// Marks a regular site completed; returns its coordinate if it changed.
    fn complete_site(
        &self,
        state: &mut SessionState,
        site_id: &SiteId,
        completed_at: DateTime<Utc>,
    ) -> Option<Coordinate> {
        let site = state
            .sites
            .iter_mut()
            .find(|site| &site.id == site_id && site.is_open())?;
        site.status = SiteStatus::Completed;
        site.completed_at = Some(completed_at);
        let coordinate = site.coordinate;
        state.recalculation_pending = true;

        tracing::info!(schedule = %self.schedule_id, site = %site_id, "Site completed");
        Some(coordinate)
    }

    fn resequence(&self, state: &mut SessionState, origin: Option<Coordinate>) {
        state.sequence = sequence::order(origin, &state.sites);
        state.sequence_revision += 1;
    }

    fn record_completion(&self, site_id: SiteId, completed_at: DateTime<Utc>) {
        let Some(store) = self.store.as_ref().map(Arc::clone) else {
            return;
        };
        let schedule_id = self.schedule_id.clone();

        self.runtime.spawn_blocking(move || {
            if let Err(err) = store.record_completion(&schedule_id, &site_id, completed_at) {
                tracing::warn!(
                    schedule = %schedule_id,
                    site = %site_id,
                    error = %err,
                    "Failed to persist site completion"
                );
            }
        });
    }

    fn publish(&self, kind: EventKind, snapshot: Snapshot) -> PublishReport {
        self.dispatcher
            .publish(self.schedule_id.as_str(), TrackingEvent::new(kind, snapshot))
    }
}

impl<P: Send + Sync> SnapshotSource for SessionInner<P> {
    fn snapshot(&self) -> Snapshot {
        self.current_snapshot()
    }
}

impl<P: Send + Sync> SnapshotSource for TrackingSession<P> {
    fn snapshot(&self) -> Snapshot {
        self.inner.current_snapshot()
    }
}

fn find_site<'a>(sites: &'a [Site], id: &SiteId) -> Result<&'a Site, TrackingError> {
    sites
        .iter()
        .find(|site| &site.id == id)
        .ok_or_else(|| TrackingError::UnknownSite(id.clone()))
}

fn find_site_mut<'a>(sites: &'a mut [Site], id: &SiteId) -> Result<&'a mut Site, TrackingError> {
    sites
        .iter_mut()
        .find(|site| &site.id == id)
        .ok_or_else(|| TrackingError::UnknownSite(id.clone()))
}
