//! Error kinds for the coordination core.
//!
//! Only ingestion and lifecycle calls return errors to callers. Provider and
//! persistence failures are recovered locally and show up as fallback routes
//! and log lines instead.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ScheduleId, SessionStatus, SiteId};

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("invalid position sample ({latitude}, {longitude})")]
    InvalidPosition { latitude: f64, longitude: f64 },

    #[error("session is {0:?}, not accepting updates")]
    SessionNotActive(SessionStatus),

    #[error("cannot move session from {from:?} to {to:?}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("unknown site {0}")]
    UnknownSite(SiteId),

    #[error("site {0} is the station and never changes status")]
    StationImmutable(SiteId),

    #[error("site {0} is already completed")]
    SiteAlreadyCompleted(SiteId),

    #[error("no site store configured for this session")]
    NoSiteStore,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("unknown schedule {0}")]
    UnknownSchedule(ScheduleId),

    #[error("no tokio runtime available to run route recomputation")]
    RuntimeUnavailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a single route provider call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("route provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("route provider unavailable: {0}")]
    Unavailable(String),

    #[error("route provider rate limited the request")]
    RateLimited,

    #[error("invalid response from route provider: {0}")]
    InvalidResponse(String),

    #[error("route cache is offline")]
    Offline,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("route cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("route cache file is not valid: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("schedule {0} not found")]
    NotFound(ScheduleId),

    #[error("site store error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
