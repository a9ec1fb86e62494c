//! Tunables for tracking sessions, the route cache and the dispatcher.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Arrival radius (km).
    pub arrival_radius_km: f64,
    /// Movement that makes a route stale (km).
    pub recalculation_distance_km: f64,
    pub min_recalculation_interval_ms: u64,
    /// Upper bound on one route provider call.
    pub provider_timeout_secs: u64,
    pub route_ttl_secs: u64,
    pub route_cache_max_entries: usize,
    /// Silence after which a subscriber pulls a snapshot itself.
    pub heartbeat_window_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Pull cadence once push delivery is gone.
    pub poll_interval_secs: u64,
    pub subscriber_queue_capacity: usize,
    /// Straight-line fallback speed heuristic (2 min/km is ~30 km/h).
    pub fallback_minutes_per_km: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            arrival_radius_km: 0.05,
            recalculation_distance_km: 0.2,
            min_recalculation_interval_ms: 2000,
            provider_timeout_secs: 5,
            route_ttl_secs: 24 * 60 * 60,
            route_cache_max_entries: 10_000,
            heartbeat_window_secs: 10,
            heartbeat_interval_secs: 5,
            poll_interval_secs: 2,
            subscriber_queue_capacity: 32,
            fallback_minutes_per_km: 2.0,
        }
    }
}

impl TrackingConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("arrival_radius_km", self.arrival_radius_km)?;
        positive("recalculation_distance_km", self.recalculation_distance_km)?;
        positive("fallback_minutes_per_km", self.fallback_minutes_per_km)?;
        if self.subscriber_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "subscriber_queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.route_cache_max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "route_cache_max_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.provider_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "provider_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn min_recalculation_interval(&self) -> Duration {
        Duration::from_millis(self.min_recalculation_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_secs(self.heartbeat_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("must be a positive number, got {}", value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = TrackingConfig::default();
        assert_eq!(config.arrival_radius_km, 0.05);
        assert_eq!(config.recalculation_distance_km, 0.2);
        assert_eq!(config.min_recalculation_interval(), Duration::from_secs(2));
        assert_eq!(config.route_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.heartbeat_window(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TrackingConfig::from_json_str(r#"{"arrival_radius_km": 0.03}"#).unwrap();
        assert_eq!(config.arrival_radius_km, 0.03);
        assert_eq!(config.recalculation_distance_km, 0.2);
        assert_eq!(config.poll_interval_secs, 2);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = TrackingConfig::from_json_str(r#"{"arrival_radius_km": -1.0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "arrival_radius_km", .. }));

        let err = TrackingConfig::from_json_str(r#"{"subscriber_queue_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        assert!(matches!(
            TrackingConfig::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracking.json");
        std::fs::write(&path, r#"{"heartbeat_window_secs": 30}"#).unwrap();

        let config = TrackingConfig::from_file(&path).unwrap();
        assert_eq!(config.heartbeat_window(), Duration::from_secs(30));

        assert!(matches!(
            TrackingConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
