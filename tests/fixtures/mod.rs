//! Shared fixtures for the coordination tests.
//!
//! Sites sit around a small depot at (8.5000, 125.9700); mock collaborators
//! live in [`mocks`].

#![allow(dead_code)]

pub mod mocks;

pub use mocks::*;

use std::sync::Arc;
use std::time::Duration;

use route_coordinator::{
    Coordinate, Schedule, SessionContext, Site, SiteId, Snapshot, TrackingConfig, TrackingSession,
};

pub const SCHEDULE: &str = "route-7";

pub const STATION: (f64, f64) = (8.5000, 125.9700);
pub const SITE_A: (f64, f64) = (8.50105, 125.97055);
pub const SITE_B: (f64, f64) = (8.5050, 125.9800);
/// Roughly 7 m from site A.
pub const NEAR_A: (f64, f64) = (8.5010, 125.9705);
/// Between A and B, outside every arrival radius.
pub const MIDWAY: (f64, f64) = (8.5030, 125.9730);

pub fn site_id(id: &str) -> SiteId {
    SiteId::new(id)
}

/// Station plus pending sites A and B.
pub fn schedule() -> Schedule {
    Schedule::new(
        SCHEDULE,
        vec![
            Site::station("depot", STATION),
            Site::pickup("a", SITE_A),
            Site::pickup("b", SITE_B),
        ],
    )
}

pub fn coordinates(points: &[(f64, f64)]) -> Vec<Coordinate> {
    points.iter().copied().map(Coordinate::from).collect()
}

pub fn context<P>(provider: Arc<P>) -> SessionContext<P> {
    SessionContext::new(provider, TrackingConfig::default())
}

/// Context with the recomputation throttle disabled.
pub fn unthrottled_context<P>(provider: Arc<P>) -> SessionContext<P> {
    let config = TrackingConfig {
        min_recalculation_interval_ms: 0,
        ..TrackingConfig::default()
    };
    SessionContext::new(provider, config)
}

/// Polls the session until `done` holds. Panics after about two seconds.
pub async fn wait_for<P, F>(session: &TrackingSession<P>, done: F) -> Snapshot
where
    P: route_coordinator::RouteProvider + 'static,
    F: Fn(&Snapshot) -> bool,
{
    for _ in 0..200 {
        let snapshot = session.snapshot();
        if done(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached the expected state: {:?}", session.snapshot());
}

/// Lets spawned work run without waiting on it.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
