//! Sessions of many vehicles, keyed by schedule.
//!
//! Sessions share nothing but the provider, the route cache and the
//! dispatcher, so batches of samples for different schedules can be applied
//! in parallel. Samples of one schedule stay on one worker, in input order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rayon::prelude::*;
use tokio::runtime::Handle;

use crate::dispatch::{Snapshot, Subscription};
use crate::error::TrackingError;
use crate::model::{PositionSample, Schedule, ScheduleId};
use crate::session::{SessionContext, TrackingSession};
use crate::traits::{RouteProvider, SiteStore};

pub struct SessionRegistry<P> {
    context: SessionContext<P>,
    sessions: RwLock<HashMap<ScheduleId, TrackingSession<P>>>,
    runtime: Handle,
}

impl<P: RouteProvider + 'static> SessionRegistry<P> {
    /// Must be called from within a tokio runtime.
    pub fn new(context: SessionContext<P>) -> Result<Self, TrackingError> {
        let runtime = Handle::try_current().map_err(|_| TrackingError::RuntimeUnavailable)?;
        Ok(Self {
            context,
            sessions: RwLock::new(HashMap::new()),
            runtime,
        })
    }

    pub fn context(&self) -> &SessionContext<P> {
        &self.context
    }

    /// Registers a session for `schedule`. A schedule that already has a live
    /// session keeps it; a finished or cancelled one is replaced.
    pub fn open(&self, schedule: Schedule) -> Result<TrackingSession<P>, TrackingError> {
        if let Some(existing) = self.live(&schedule.id) {
            return Ok(existing);
        }
        let session = TrackingSession::new(schedule, &self.context)?;
        Ok(self.insert(session))
    }

    /// Like [`SessionRegistry::open`], reading the schedule from `store`.
    pub fn load(
        &self,
        schedule_id: &ScheduleId,
        store: Arc<dyn SiteStore>,
    ) -> Result<TrackingSession<P>, TrackingError> {
        if let Some(existing) = self.live(schedule_id) {
            return Ok(existing);
        }
        let session = TrackingSession::load(schedule_id, store, &self.context)?;
        Ok(self.insert(session))
    }

    pub fn get(&self, schedule_id: &ScheduleId) -> Option<TrackingSession<P>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(schedule_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule_ids(&self) -> Vec<ScheduleId> {
        let mut ids: Vec<ScheduleId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Finishes the session and removes it from the registry.
    pub fn finish(&self, schedule_id: &ScheduleId) -> Result<Snapshot, TrackingError> {
        let snapshot = self.require(schedule_id)?.finish()?;
        self.remove(schedule_id);
        Ok(snapshot)
    }

    /// Cancels the session and removes it from the registry.
    pub fn cancel(&self, schedule_id: &ScheduleId) -> Result<Snapshot, TrackingError> {
        let snapshot = self.require(schedule_id)?.cancel()?;
        self.remove(schedule_id);
        Ok(snapshot)
    }

    pub fn subscribe(&self, schedule_id: &ScheduleId) -> Result<Subscription, TrackingError> {
        Ok(self.require(schedule_id)?.subscribe())
    }

    pub fn ingest(
        &self,
        schedule_id: &ScheduleId,
        sample: PositionSample,
    ) -> Result<Snapshot, TrackingError> {
        self.require(schedule_id)?.ingest_position(sample)
    }

    /// Applies samples for many schedules in parallel. Results come back in
    /// input order. Blocks the calling thread until the batch is done.
    pub fn ingest_batch(
        &self,
        samples: Vec<(ScheduleId, PositionSample)>,
    ) -> Vec<Result<Snapshot, TrackingError>> {
        let total = samples.len();

        let mut groups: Vec<(ScheduleId, Vec<(usize, PositionSample)>)> = Vec::new();
        let mut group_index: HashMap<ScheduleId, usize> = HashMap::new();
        for (index, (schedule_id, sample)) in samples.into_iter().enumerate() {
            let slot = *group_index.entry(schedule_id.clone()).or_insert_with(|| {
                groups.push((schedule_id, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((index, sample));
        }

        tracing::debug!(
            samples = total,
            schedules = groups.len(),
            "Ingesting position batch"
        );

        let mut results: Vec<(usize, Result<Snapshot, TrackingError>)> = groups
            .into_par_iter()
            .flat_map_iter(|(schedule_id, samples)| {
                let _runtime = self.runtime.enter();
                let session = self.get(&schedule_id);
                samples
                    .into_iter()
                    .map(|(index, sample)| {
                        let result = match &session {
                            Some(session) => session.ingest_position(sample),
                            None => Err(TrackingError::UnknownSchedule(schedule_id.clone())),
                        };
                        (index, result)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn require(&self, schedule_id: &ScheduleId) -> Result<TrackingSession<P>, TrackingError> {
        self.get(schedule_id)
            .ok_or_else(|| TrackingError::UnknownSchedule(schedule_id.clone()))
    }

    fn live(&self, schedule_id: &ScheduleId) -> Option<TrackingSession<P>> {
        self.get(schedule_id)
            .filter(|session| !session.status().is_terminal())
    }

    fn insert(&self, session: TrackingSession<P>) -> TrackingSession<P> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .entry(session.schedule_id().clone())
            .and_modify(|existing| {
                if existing.status().is_terminal() {
                    *existing = session.clone();
                }
            })
            .or_insert_with(|| session.clone())
            .clone();

        tracing::info!(schedule = %session.schedule_id(), "Tracking session opened");
        session
    }

    fn remove(&self, schedule_id: &ScheduleId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(schedule_id);
    }
}
