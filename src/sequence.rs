//! Visit sequencing (greedy nearest neighbour).
//!
//! Pickup counts per run are small and the sequence is rebuilt after every
//! completion, so a plain O(n²) nearest-neighbour pass is used instead of a
//! tour-improvement search.

use crate::geo::{Coordinate, haversine_km};
use crate::model::{Site, VisitSequence};

/// Distances closer than this are treated as equal (km).
const TIE_TOLERANCE_KM: f64 = 1e-9;

/// Orders the open regular sites starting from `origin`.
///
/// Stations and completed sites are skipped. Equidistant candidates keep
/// their input order. Without an origin the input order is returned as is.
pub fn order(origin: Option<Coordinate>, sites: &[Site]) -> VisitSequence {
    let mut remaining: Vec<&Site> = sites.iter().filter(|site| site.is_open()).collect();

    let Some(origin) = origin else {
        return VisitSequence::new(remaining.into_iter().map(|site| site.id.clone()).collect());
    };

    let mut ordered = Vec::with_capacity(remaining.len());
    let mut current = origin;

    while let Some(index) = nearest(current, &remaining) {
        let site = remaining.remove(index);
        current = site.coordinate;
        ordered.push(site.id.clone());
    }

    VisitSequence::new(ordered)
}

/// Index of the candidate closest to `from`; earliest wins ties.
fn nearest(from: Coordinate, candidates: &[&Site]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;

    for (index, site) in candidates.iter().enumerate() {
        let distance = haversine_km(from, site.coordinate);
        match best {
            Some((_, best_distance)) if distance >= best_distance - TIE_TOLERANCE_KM => {}
            _ => best = Some((index, distance)),
        }
    }

    best.map(|(index, _)| index)
}
