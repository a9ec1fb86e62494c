//! Collaborator interfaces consumed by the coordination core.
//!
//! The core never implements these itself (apart from the OSRM adapter);
//! applications plug in their own routing backend and site storage.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::{ProviderError, StoreError};
use crate::geo::Coordinate;
use crate::model::{Schedule, ScheduleId, SiteId};

/// Raw answer of a routing backend, before it becomes a [`crate::model::Route`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRoute {
    pub path: Vec<Coordinate>,
    pub distance_km: f64,
    pub duration_minutes: u32,
}

/// Turns an ordered waypoint list into a drivable path.
///
/// Treat implementations as slow and unreliable: callers bound every call
/// with a timeout and fall back to a straight-line estimate on failure.
pub trait RouteProvider: Send + Sync {
    fn route(
        &self,
        waypoints: &[Coordinate],
    ) -> impl Future<Output = Result<ProviderRoute, ProviderError>> + Send;

    /// Name used in log lines.
    fn name(&self) -> &str {
        "route-provider"
    }
}

/// Read/write access to schedule data owned elsewhere.
///
/// Calls may block; the session runs writes on the blocking pool.
pub trait SiteStore: Send + Sync {
    fn load_schedule(&self, schedule_id: &ScheduleId) -> Result<Schedule, StoreError>;

    fn record_completion(
        &self,
        schedule_id: &ScheduleId,
        site_id: &SiteId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
