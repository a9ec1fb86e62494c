//! Data model shared by every component.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;
use crate::geo::{Coordinate, format_duration};

/// Stable identity of a site within a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifies one vehicle's active schedule; also the dispatcher topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(String);

impl ScheduleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScheduleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteKind {
    RegularSite,
    /// The depot. Never visited as a stop, never changes status.
    Station,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteStatus {
    Pending,
    InProgress,
    Completed,
}

/// A pickup point or the schedule's station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub coordinate: Coordinate,
    pub kind: SiteKind,
    pub status: SiteStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Site {
    pub fn pickup(id: impl Into<String>, coordinate: impl Into<Coordinate>) -> Self {
        Self {
            id: SiteId::new(id),
            coordinate: coordinate.into(),
            kind: SiteKind::RegularSite,
            status: SiteStatus::Pending,
            completed_at: None,
        }
    }

    pub fn station(id: impl Into<String>, coordinate: impl Into<Coordinate>) -> Self {
        Self {
            kind: SiteKind::Station,
            ..Self::pickup(id, coordinate)
        }
    }

    pub fn with_status(mut self, status: SiteStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_station(&self) -> bool {
        self.kind == SiteKind::Station
    }

    /// Regular site that still needs a visit (Pending or InProgress).
    pub fn is_open(&self) -> bool {
        !self.is_station() && self.status != SiteStatus::Completed
    }

    /// Regular site that the proximity detector may complete.
    pub fn is_pending(&self) -> bool {
        !self.is_station() && self.status == SiteStatus::Pending
    }
}

/// The site list of one schedule as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub sites: Vec<Site>,
}

impl Schedule {
    pub fn new(id: impl Into<String>, sites: Vec<Site>) -> Self {
        Self {
            id: ScheduleId::new(id),
            sites,
        }
    }

    pub fn station(&self) -> Option<&Site> {
        self.sites.iter().find(|site| site.is_station())
    }

    /// Checks for exactly one station and unique site ids.
    pub fn validate(&self) -> Result<(), TrackingError> {
        let stations = self.sites.iter().filter(|site| site.is_station()).count();
        if stations != 1 {
            return Err(TrackingError::InvalidSchedule(format!(
                "schedule {} has {} stations, expected exactly one",
                self.id, stations
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for site in &self.sites {
            if !seen.insert(&site.id) {
                return Err(TrackingError::InvalidSchedule(format!(
                    "duplicate site id {}",
                    site.id
                )));
            }
            if !site.coordinate.is_valid() {
                return Err(TrackingError::InvalidSchedule(format!(
                    "site {} has an invalid coordinate",
                    site.id
                )));
            }
        }

        Ok(())
    }
}

/// One vehicle position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    pub accuracy_meters: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(coordinate: impl Into<Coordinate>, captured_at: DateTime<Utc>) -> Self {
        Self {
            coordinate: coordinate.into(),
            accuracy_meters: None,
            captured_at,
        }
    }

    /// Sample captured now.
    pub fn at(coordinate: impl Into<Coordinate>) -> Self {
        Self::new(coordinate, Utc::now())
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy_meters = Some(meters);
        self
    }

    pub fn validate(&self) -> Result<(), TrackingError> {
        if self.coordinate.is_valid() {
            Ok(())
        } else {
            Err(TrackingError::InvalidPosition {
                latitude: self.coordinate.latitude,
                longitude: self.coordinate.longitude,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginKind {
    DriverOrigin,
    StationOrigin,
}

/// A drivable path through the current sequence. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub path: Vec<Coordinate>,
    pub distance_km: f64,
    pub duration_minutes: u32,
    /// Synthesised locally because the provider could not be reached.
    pub is_estimate_fallback: bool,
    pub computed_at: DateTime<Utc>,
    pub origin_kind: OriginKind,
}

impl Route {
    /// Route reported when no open sites remain.
    pub fn empty(origin_kind: OriginKind) -> Self {
        Self {
            path: Vec::new(),
            distance_km: 0.0,
            duration_minutes: 0,
            is_estimate_fallback: false,
            computed_at: Utc::now(),
            origin_kind,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// Duration text, marked as an estimate for fallback routes.
    pub fn eta_label(&self) -> String {
        let duration = format_duration(self.duration_minutes);
        if self.is_estimate_fallback {
            format!("Estimated {}", duration)
        } else {
            duration
        }
    }
}

/// Planned visit order of the open regular sites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitSequence(Vec<SiteId>);

impl VisitSequence {
    pub fn new(ids: Vec<SiteId>) -> Self {
        Self(ids)
    }

    pub fn ids(&self) -> &[SiteId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &SiteId) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SiteId> {
        self.0.iter()
    }
}

/// Lifecycle of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Inactive,
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}
