//! OSRM HTTP adapter for driving routes.

use serde::Deserialize;

use crate::error::ProviderError;
use crate::geo::Coordinate;
use crate::polyline::{PRECISION_5, Polyline};
use crate::traits::{ProviderRoute, RouteProvider};

#[derive(Debug, Clone)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_secs: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            profile: "car".to_string(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsrmRouteProvider {
    config: OsrmConfig,
    client: reqwest::Client,
}

impl OsrmRouteProvider {
    pub fn new(config: OsrmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn route_url(&self, waypoints: &[Coordinate]) -> String {
        let coords = waypoints
            .iter()
            .map(|point| format!("{:.6},{:.6}", point.longitude, point.latitude))
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}/route/v1/{}/{}?overview=full&geometries=polyline",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            coords
        )
    }

    fn classify(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(std::time::Duration::from_secs(self.config.timeout_secs))
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

impl RouteProvider for OsrmRouteProvider {
    async fn route(&self, waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
        if waypoints.len() < 2 {
            return Err(ProviderError::InvalidResponse(
                "at least two waypoints are required".to_string(),
            ));
        }

        let response = self
            .client
            .get(self.route_url(waypoints))
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }

        let body = response
            .error_for_status()
            .map_err(|err| self.classify(err))?
            .json::<OsrmRouteResponse>()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;

        body.into_provider_route()
    }

    fn name(&self) -> &str {
        "osrm"
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: String,
    /// Meters.
    distance: f64,
    /// Seconds.
    duration: f64,
}

impl OsrmRouteResponse {
    fn into_provider_route(self) -> Result<ProviderRoute, ProviderError> {
        if self.code != "Ok" {
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                self.code,
                self.message.unwrap_or_default()
            )));
        }

        let route = self
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no routes returned".to_string()))?;

        let path = Polyline::decode(&route.geometry, PRECISION_5)
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?
            .into_points();

        Ok(ProviderRoute {
            path,
            distance_km: route.distance / 1000.0,
            duration_minutes: (route.duration / 60.0).round().max(0.0) as u32,
        })
    }
}
