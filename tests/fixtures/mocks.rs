//! Hand-written collaborators for the session tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use route_coordinator::geo::path_distance_km;
use route_coordinator::{
    Coordinate, ProviderError, ProviderRoute, RouteProvider, Schedule, ScheduleId, SiteId,
    SiteStore, StoreError,
};

/// Answers every request with the waypoints themselves as path, and
/// remembers what it was asked.
#[derive(Default)]
pub struct RecordingProvider {
    requests: Mutex<Vec<Vec<Coordinate>>>,
}

impl RecordingProvider {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<Coordinate>> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self, waypoints: &[Coordinate]) -> ProviderRoute {
        self.requests.lock().unwrap().push(waypoints.to_vec());
        let distance_km = path_distance_km(waypoints) * 1.3;
        ProviderRoute {
            path: waypoints.to_vec(),
            distance_km,
            duration_minutes: (distance_km * 3.0).ceil() as u32,
        }
    }
}

impl RouteProvider for RecordingProvider {
    async fn route(&self, waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
        Ok(self.answer(waypoints))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[derive(Default)]
pub struct FailingProvider {
    calls: AtomicUsize,
}

impl FailingProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RouteProvider for FailingProvider {
    async fn route(&self, _waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Unavailable("connection refused".to_string()))
    }
}

/// Holds every request until the test releases it.
pub struct GatedProvider {
    gate: Semaphore,
    started: AtomicUsize,
    inner: RecordingProvider,
}

impl GatedProvider {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            inner: RecordingProvider::default(),
        }
    }

    /// Lets `n` waiting (or future) requests finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.inner.calls()
    }
}

impl RouteProvider for GatedProvider {
    async fn route(&self, waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("gate closed".to_string()))?;
        permit.forget();
        Ok(self.inner.answer(waypoints))
    }
}

/// In-memory schedule storage.
#[derive(Default)]
pub struct MemoryStore {
    schedules: Mutex<HashMap<ScheduleId, Schedule>>,
    completions: Mutex<Vec<(ScheduleId, SiteId, DateTime<Utc>)>>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn with_schedule(schedule: Schedule) -> Self {
        let store = Self::default();
        store.put(schedule);
        store
    }

    /// Every `record_completion` fails.
    pub fn failing_writes(schedule: Schedule) -> Self {
        let store = Self {
            fail_writes: true,
            ..Self::default()
        };
        store.put(schedule);
        store
    }

    pub fn put(&self, schedule: Schedule) {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.id.clone(), schedule);
    }

    pub fn completed_sites(&self) -> Vec<SiteId> {
        self.completions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, site, _)| site.clone())
            .collect()
    }
}

impl SiteStore for MemoryStore {
    fn load_schedule(&self, schedule_id: &ScheduleId) -> Result<Schedule, StoreError> {
        self.schedules
            .lock()
            .unwrap()
            .get(schedule_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(schedule_id.clone()))
    }

    fn record_completion(
        &self,
        schedule_id: &ScheduleId,
        site_id: &SiteId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.completions
            .lock()
            .unwrap()
            .push((schedule_id.clone(), site_id.clone(), completed_at));
        Ok(())
    }
}
