//! Arrival detection from position samples.
//!
//! The radius is deliberately generous relative to typical GPS error; a
//! missed completion can always be reported manually.

use crate::geo::{Coordinate, haversine_km};
use crate::model::{Site, SiteId};

/// Arrival radius in kilometers (50 m).
pub const DEFAULT_ARRIVAL_RADIUS_KM: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub struct ProximityDetector {
    pub radius_km: f64,
}

impl Default for ProximityDetector {
    fn default() -> Self {
        Self {
            radius_km: DEFAULT_ARRIVAL_RADIUS_KM,
        }
    }
}

impl ProximityDetector {
    pub fn new(radius_km: f64) -> Self {
        Self { radius_km }
    }

    /// Nearest pending regular site strictly inside the radius, if any.
    pub fn check_arrival<'a, I>(&self, position: Coordinate, candidates: I) -> Option<SiteId>
    where
        I: IntoIterator<Item = &'a Site>,
    {
        let mut best: Option<(&Site, f64)> = None;

        for site in candidates.into_iter().filter(|site| site.is_pending()) {
            let distance = haversine_km(position, site.coordinate);
            if distance >= self.radius_km {
                continue;
            }
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((site, distance)),
            }
        }

        best.map(|(site, _)| site.id.clone())
    }
}
