//! Route staleness decisions.

use std::time::Duration;

use tokio::time::Instant;

use crate::geo::{Coordinate, haversine_km};
use crate::model::Route;

/// Movement (km) beyond which a route is considered stale.
pub const DEFAULT_RECALCULATION_DISTANCE_KM: f64 = 0.2;

/// Minimum spacing between two provider requests.
pub const DEFAULT_MIN_RECALCULATION_INTERVAL: Duration = Duration::from_secs(2);

/// Decides whether a new position sample warrants a fresh route.
#[derive(Debug, Clone, Copy)]
pub struct RecalculationPolicy {
    pub threshold_km: f64,
}

impl Default for RecalculationPolicy {
    fn default() -> Self {
        Self {
            threshold_km: DEFAULT_RECALCULATION_DISTANCE_KM,
        }
    }
}

impl RecalculationPolicy {
    pub fn new(threshold_km: f64) -> Self {
        Self { threshold_km }
    }

    /// `previous_position` is the point the current route was computed from.
    pub fn should_recalculate(
        &self,
        previous_route: Option<&Route>,
        previous_position: Option<Coordinate>,
        new_position: Coordinate,
    ) -> bool {
        if previous_route.is_none() {
            return true;
        }

        match previous_position {
            None => true,
            Some(previous) => self.has_moved(previous, new_position),
        }
    }

    /// Strictly more than the threshold away.
    pub fn has_moved(&self, from: Coordinate, to: Coordinate) -> bool {
        haversine_km(from, to) > self.threshold_km
    }
}

/// Rate limit on recomputation attempts, independent of the policy's answer.
#[derive(Debug, Clone)]
pub struct RecalculationThrottle {
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl RecalculationThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: None,
        }
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn allows(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    /// Records an attempt if allowed; returns whether it was.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if !self.allows(now) {
            return false;
        }
        self.last_attempt = Some(now);
        true
    }
}

impl Default for RecalculationThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RECALCULATION_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OriginKind;

    fn some_route() -> Route {
        Route::empty(OriginKind::DriverOrigin)
    }

    #[test]
    fn test_no_route_always_recalculates() {
        let policy = RecalculationPolicy::default();
        let p = Coordinate::new(8.5, 125.97);
        assert!(policy.should_recalculate(None, Some(p), p));
    }

    #[test]
    fn test_no_previous_position_recalculates() {
        let policy = RecalculationPolicy::default();
        let route = some_route();
        assert!(policy.should_recalculate(Some(&route), None, Coordinate::new(8.5, 125.97)));
    }

    #[test]
    fn test_jitter_vs_real_movement() {
        let policy = RecalculationPolicy::default();
        let route = some_route();
        let p1 = Coordinate::new(8.5000, 125.9700);
        let p2 = Coordinate::new(8.5001, 125.9701);
        let p3 = Coordinate::new(8.5030, 125.9730);

        assert!(!policy.should_recalculate(Some(&route), Some(p1), p2));
        assert!(policy.should_recalculate(Some(&route), Some(p1), p3));
    }

    #[test]
    fn test_threshold_boundaries() {
        let policy = RecalculationPolicy::default();
        let route = some_route();
        let origin = Coordinate::new(0.0, 0.0);
        // 0.001 degree of latitude is ~0.1112 km
        let below = Coordinate::new(0.0017, 0.0);
        let above = Coordinate::new(0.0019, 0.0);

        assert!(haversine_km(origin, below) < 0.2);
        assert!(haversine_km(origin, above) > 0.2);
        assert!(!policy.should_recalculate(Some(&route), Some(origin), below));
        assert!(policy.should_recalculate(Some(&route), Some(origin), above));
    }

    #[test]
    fn test_throttle_spacing() {
        let start = Instant::now();
        let mut throttle = RecalculationThrottle::default();

        assert!(throttle.try_acquire(start));
        assert!(!throttle.try_acquire(start + Duration::from_millis(500)));
        assert!(!throttle.try_acquire(start + Duration::from_millis(1999)));
        assert!(throttle.try_acquire(start + Duration::from_secs(2)));
        assert_eq!(throttle.last_attempt(), Some(start + Duration::from_secs(2)));
    }
}
