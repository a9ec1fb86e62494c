//! route-coordinator
//!
//! Live coordination of one vehicle working through a schedule of pickup
//! sites: arrival detection, visit ordering, route recomputation with a
//! cached and fallback-protected routing backend, and snapshot fan-out to
//! observers.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod model;
pub mod osrm;
pub mod policy;
pub mod polyline;
pub mod proximity;
pub mod registry;
pub mod sequence;
pub mod session;
pub mod traits;

pub use cache::{CacheStats, RouteCache, RouteCacheConfig};
pub use config::TrackingConfig;
pub use dispatch::{Delivery, Dispatcher, DispatcherConfig, EventKind, Snapshot, Subscription, TrackingEvent};
pub use error::{CacheError, ConfigError, ProviderError, StoreError, TrackingError};
pub use geo::Coordinate;
pub use model::{
    OriginKind, PositionSample, Route, Schedule, ScheduleId, SessionStatus, Site, SiteId, SiteKind,
    SiteStatus, VisitSequence,
};
pub use registry::SessionRegistry;
pub use session::{SessionContext, TrackingSession};
pub use traits::{ProviderRoute, RouteProvider, SiteStore};
