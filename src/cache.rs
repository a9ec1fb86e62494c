//! Route memoisation with a straight-line fallback.
//!
//! Provider answers are kept per exact waypoint list (rounded to 6 decimals)
//! for a fixed TTL and optionally written through to a JSON file, so routes
//! keep being served across restarts and connectivity loss. When the
//! provider fails, times out or the cache is switched offline, a route is
//! synthesised from straight lines instead. Such estimates are never cached.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrackingConfig;
use crate::error::{CacheError, ProviderError};
use crate::geo::{Coordinate, path_distance_km};
use crate::model::{OriginKind, Route};
use crate::traits::RouteProvider;

/// Fallback speed heuristic: 2 minutes per km, roughly 30 km/h.
pub const FALLBACK_MINUTES_PER_KM: f64 = 2.0;

/// Upper bound on cached routes before the oldest are evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

const CACHE_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct RouteCacheConfig {
    pub ttl: Duration,
    pub provider_timeout: Duration,
    pub fallback_minutes_per_km: f64,
    pub max_entries: usize,
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            provider_timeout: Duration::from_secs(5),
            fallback_minutes_per_km: FALLBACK_MINUTES_PER_KM,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl From<&TrackingConfig> for RouteCacheConfig {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            ttl: config.route_ttl(),
            provider_timeout: config.provider_timeout(),
            fallback_minutes_per_km: config.fallback_minutes_per_km,
            max_entries: config.route_cache_max_entries,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub provider_failures: u64,
    pub fallbacks: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    route: Route,
    stored_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    entries: &'a HashMap<String, CacheEntry>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    provider_failures: AtomicU64,
    fallbacks: AtomicU64,
    evictions: AtomicU64,
}

/// Owns the cache file. Writes are serialised and never go backwards: a
/// snapshot older than the one already on disk is skipped.
#[derive(Debug)]
struct Persister {
    path: PathBuf,
    /// Generation of the snapshot currently on disk.
    written: Mutex<u64>,
}

/// Serialised cache contents waiting to be written.
struct PersistJob {
    persister: Arc<Persister>,
    generation: u64,
    bytes: Vec<u8>,
}

impl PersistJob {
    fn write(self) -> Result<(), CacheError> {
        let mut written = self
            .persister
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.generation <= *written {
            return Ok(());
        }

        let path = &self.persister.path;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &self.bytes)?;
        fs::rename(tmp_path, path)?;
        *written = self.generation;
        Ok(())
    }
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    /// Bumped on every change that should reach the file.
    generation: u64,
}

#[derive(Debug)]
pub struct RouteCache {
    entries: Mutex<Entries>,
    persister: Option<Arc<Persister>>,
    offline: AtomicBool,
    counters: Counters,
    config: RouteCacheConfig,
}

/// Cache key for an ordered waypoint list.
pub fn cache_key(waypoints: &[Coordinate]) -> String {
    waypoints
        .iter()
        .map(Coordinate::key)
        .collect::<Vec<_>>()
        .join(";")
}

/// Straight-line estimate using the default speed heuristic.
pub fn straight_line_route(waypoints: &[Coordinate]) -> Route {
    straight_line_route_with(waypoints, FALLBACK_MINUTES_PER_KM)
}

/// Path through the waypoints as given, summed haversine distance,
/// `round(distance * minutes_per_km)` minutes, flagged as an estimate.
pub fn straight_line_route_with(waypoints: &[Coordinate], minutes_per_km: f64) -> Route {
    let distance_km = path_distance_km(waypoints);
    Route {
        path: waypoints.to_vec(),
        distance_km,
        duration_minutes: (distance_km * minutes_per_km).round() as u32,
        is_estimate_fallback: true,
        computed_at: Utc::now(),
        origin_kind: OriginKind::DriverOrigin,
    }
}

impl RouteCache {
    /// Cache without persistence.
    pub fn in_memory(config: RouteCacheConfig) -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                generation: 0,
            }),
            persister: None,
            offline: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        }
    }

    /// Opens (or creates) a file-backed cache and drops expired entries.
    ///
    /// An unreadable cache file is logged and replaced by an empty cache.
    pub fn open(path: impl Into<PathBuf>, config: RouteCacheConfig) -> Result<Self, CacheError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = match load_entries(&path) {
            Ok(entries) => entries,
            Err(CacheError::Serde(err)) => {
                tracing::warn!(path = %path.display(), error = %err, "Discarding unreadable route cache file");
                HashMap::new()
            }
            Err(err) => return Err(err),
        };

        let cache = Self {
            entries: Mutex::new(Entries {
                map: entries,
                generation: 0,
            }),
            persister: Some(Arc::new(Persister {
                path,
                written: Mutex::new(0),
            })),
            ..Self::in_memory(config)
        };

        let purged = cache.purge_expired();
        let evicted = cache.evict_over_limit(&mut cache.entries());
        tracing::debug!(entries = cache.len(), purged, evicted, "Route cache opened");
        Ok(cache)
    }

    pub fn set_offline(&self, offline: bool) {
        let was = self.offline.swap(offline, Ordering::SeqCst);
        if was != offline {
            tracing::info!(offline, "Route cache connectivity changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Cached route for these waypoints, if present and not expired.
    pub fn get(&self, waypoints: &[Coordinate]) -> Option<Route> {
        self.lookup(&cache_key(waypoints), Utc::now())
    }

    /// Returns a route for the waypoints. Never fails: any provider problem
    /// yields a straight-line estimate.
    pub async fn get_or_compute<P>(&self, waypoints: &[Coordinate], provider: &P) -> Route
    where
        P: RouteProvider + ?Sized,
    {
        if waypoints.len() < 2 {
            return self.fallback(waypoints);
        }

        let key = cache_key(waypoints);
        if let Some(route) = self.lookup(&key, Utc::now()) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return route;
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        match self.call_provider(waypoints, provider).await {
            Ok(route) => {
                if let Some(job) = self.store(key, route.clone()) {
                    // file I/O stays off the async workers
                    let written = tokio::task::spawn_blocking(move || job.write()).await;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::warn!(error = %err, "Failed to persist route cache"),
                        Err(err) => tracing::warn!(error = %err, "Route cache write task failed"),
                    }
                }
                route
            }
            Err(ProviderError::Offline) => {
                tracing::debug!(waypoints = waypoints.len(), "Route cache offline, using straight-line estimate");
                self.fallback(waypoints)
            }
            Err(err) => {
                self.counters.provider_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    provider = provider.name(),
                    error = %err,
                    waypoints = waypoints.len(),
                    "Route provider failed, using straight-line estimate"
                );
                self.fallback(waypoints)
            }
        }
    }

    async fn call_provider<P>(&self, waypoints: &[Coordinate], provider: &P) -> Result<Route, ProviderError>
    where
        P: RouteProvider + ?Sized,
    {
        if self.is_offline() {
            return Err(ProviderError::Offline);
        }

        let found = tokio::time::timeout(self.config.provider_timeout, provider.route(waypoints))
            .await
            .map_err(|_| ProviderError::Timeout(self.config.provider_timeout))??;

        let path = if found.path.is_empty() {
            waypoints.to_vec()
        } else {
            found.path
        };

        Ok(Route {
            path,
            distance_km: found.distance_km,
            duration_minutes: found.duration_minutes,
            is_estimate_fallback: false,
            computed_at: Utc::now(),
            origin_kind: OriginKind::DriverOrigin,
        })
    }

    fn fallback(&self, waypoints: &[Coordinate]) -> Route {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        straight_line_route_with(waypoints, self.config.fallback_minutes_per_km)
    }

    fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<Route> {
        let mut entries = self.entries();
        let entry = entries.map.get(key)?;
        if self.is_expired(entry, now) {
            entries.map.remove(key);
            return None;
        }
        Some(entry.route.clone())
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.stored_at).to_std() {
            Ok(age) => age > self.config.ttl,
            // stored in the future (clock change): keep it
            Err(_) => false,
        }
    }

    /// Inserts a provider route, drops expired and surplus entries, and
    /// returns the file write to run, if the cache is file-backed.
    fn store(&self, key: String, route: Route) -> Option<PersistJob> {
        let now = Utc::now();
        let entry = CacheEntry {
            stored_at: route.computed_at,
            route,
        };

        let mut entries = self.entries();
        entries.map.insert(key, entry);
        entries.map.retain(|_, entry| !self.is_expired(entry, now));
        self.evict_over_limit(&mut entries);
        entries.generation += 1;

        match self.persist_job(&entries) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to serialise route cache");
                None
            }
        }
    }

    /// Drops the oldest entries once the cache holds more than `max_entries`,
    /// down to 90% of the limit.
    fn evict_over_limit(&self, entries: &mut Entries) -> usize {
        let limit = self.config.max_entries.max(1);
        if entries.map.len() <= limit {
            return 0;
        }

        let target = (limit * 9 / 10).max(1);
        let mut by_age: Vec<(DateTime<Utc>, String)> = entries
            .map
            .iter()
            .map(|(key, entry)| (entry.stored_at, key.clone()))
            .collect();
        by_age.sort();

        let surplus = entries.map.len() - target;
        for (_, key) in by_age.into_iter().take(surplus) {
            entries.map.remove(&key);
        }
        entries.generation += 1;
        self.counters.evictions.fetch_add(surplus as u64, Ordering::Relaxed);
        tracing::debug!(evicted = surplus, limit, "Route cache over limit, evicted oldest entries");
        surplus
    }

    fn persist_job(&self, entries: &Entries) -> Result<Option<PersistJob>, CacheError> {
        let Some(persister) = &self.persister else {
            return Ok(None);
        };
        let bytes = serde_json::to_vec(&CacheFileRef {
            version: CACHE_FILE_VERSION,
            entries: &entries.map,
        })?;
        Ok(Some(PersistJob {
            persister: Arc::clone(persister),
            generation: entries.generation,
            bytes,
        }))
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries();
        let before = entries.map.len();
        entries.map.retain(|_, entry| !self.is_expired(entry, now));
        let purged = before - entries.map.len();
        if purged > 0 {
            entries.generation += 1;
        }
        purged
    }

    /// Writes all entries to the backing file (no-op for in-memory caches).
    pub fn flush(&self) -> Result<(), CacheError> {
        let job = {
            let mut entries = self.entries();
            entries.generation += 1;
            self.persist_job(&entries)?
        };
        match job {
            Some(job) => job.write(),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            provider_failures: self.counters.provider_failures.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_entries(path: &Path) -> Result<HashMap<String, CacheEntry>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };

    let file: CacheFile = serde_json::from_slice(&bytes)?;
    if file.version != CACHE_FILE_VERSION {
        tracing::warn!(version = file.version, "Ignoring route cache file with unknown version");
        return Ok(HashMap::new());
    }
    Ok(file.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ProviderRoute;
    use std::sync::atomic::AtomicUsize;

    fn waypoints() -> Vec<Coordinate> {
        vec![
            Coordinate::new(8.5000, 125.9700),
            Coordinate::new(8.5010, 125.9705),
            Coordinate::new(8.5050, 125.9800),
        ]
    }

    struct FailingProvider;

    impl RouteProvider for FailingProvider {
        async fn route(&self, _waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
            Err(ProviderError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowProvider;

    impl RouteProvider for SlowProvider {
        async fn route(&self, waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProviderRoute {
                path: waypoints.to_vec(),
                distance_km: 1.0,
                duration_minutes: 1,
            })
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl RouteProvider for CountingProvider {
        async fn route(&self, waypoints: &[Coordinate]) -> Result<ProviderRoute, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderRoute {
                path: waypoints.to_vec(),
                distance_km: 2.4,
                duration_minutes: 7,
            })
        }
    }

    #[tokio::test]
    async fn test_failing_provider_yields_straight_line() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let points = waypoints();

        let route = cache.get_or_compute(&points, &FailingProvider).await;

        let expected = path_distance_km(&points);
        assert!(route.is_estimate_fallback);
        assert_eq!(route.path, points);
        assert!((route.distance_km - expected).abs() < 1e-12);
        assert_eq!(route.duration_minutes, (expected * 2.0).round() as u32);
        assert_eq!(cache.stats().provider_failures, 1);
        assert!(cache.is_empty(), "estimates must not be cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_straight_line() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let points = waypoints();

        let route = cache.get_or_compute(&points, &SlowProvider).await;

        assert!(route.is_estimate_fallback);
        assert_eq!(route.duration_minutes, (route.distance_km * 2.0).round() as u32);
    }

    #[tokio::test]
    async fn test_provider_route_is_cached() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let provider = CountingProvider::default();
        let points = waypoints();

        let first = cache.get_or_compute(&points, &provider).await;
        let second = cache.get_or_compute(&points, &provider).await;

        assert!(!first.is_estimate_fallback);
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_key_absorbs_float_noise() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let provider = CountingProvider::default();
        let points = waypoints();
        let noisy: Vec<Coordinate> = points
            .iter()
            .map(|p| Coordinate::new(p.latitude + 1e-9, p.longitude - 1e-9))
            .collect();

        cache.get_or_compute(&points, &provider).await;
        cache.get_or_compute(&noisy, &provider).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_skips_provider_but_serves_cache() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let provider = CountingProvider::default();
        let points = waypoints();
        cache.get_or_compute(&points, &provider).await;

        cache.set_offline(true);
        let cached = cache.get_or_compute(&points, &provider).await;
        assert!(!cached.is_estimate_fallback);

        let other = vec![points[0], points[2]];
        let estimate = cache.get_or_compute(&other, &provider).await;
        assert!(estimate.is_estimate_fallback);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        cache.set_offline(false);
        let fresh = cache.get_or_compute(&other, &provider).await;
        assert!(!fresh.is_estimate_fallback);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recovers_after_provider_comes_back() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let points = waypoints();

        assert!(cache.get_or_compute(&points, &FailingProvider).await.is_estimate_fallback);
        let provider = CountingProvider::default();
        assert!(!cache.get_or_compute(&points, &provider).await.is_estimate_fallback);
    }

    #[tokio::test]
    async fn test_single_waypoint_never_calls_provider() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let provider = CountingProvider::default();
        let route = cache.get_or_compute(&waypoints()[..1], &provider).await;
        assert_eq!(route.distance_km, 0.0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = RouteCache::in_memory(RouteCacheConfig::default());
        let points = waypoints();
        let key = cache_key(&points);
        let mut route = straight_line_route(&points);
        route.is_estimate_fallback = false;
        cache.store(key.clone(), route.clone());

        let now = route.computed_at;
        assert!(cache.lookup(&key, now + chrono::Duration::hours(23)).is_some());
        assert!(cache.lookup(&key, now + chrono::Duration::hours(25)).is_none());
        assert!(cache.is_empty());

        cache.store(key, route);
        assert_eq!(cache.purge_expired_at(now + chrono::Duration::hours(25)), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes").join("cache.json");
        let points = waypoints();

        {
            let cache = RouteCache::open(&path, RouteCacheConfig::default()).unwrap();
            cache.get_or_compute(&points, &CountingProvider::default()).await;
        }

        let reopened = RouteCache::open(&path, RouteCacheConfig::default()).unwrap();
        assert_eq!(reopened.len(), 1);

        // provider is down, but the persisted route is still served
        let route = reopened.get_or_compute(&points, &FailingProvider).await;
        assert!(!route.is_estimate_fallback);
        assert!((route.distance_km - 2.4).abs() < 1e-12);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{ not json").unwrap();

        let cache = RouteCache::open(&path, RouteCacheConfig::default()).unwrap();
        assert!(cache.is_empty());
    }

    fn from_origin(i: usize) -> Vec<Coordinate> {
        let mut points = waypoints();
        points[0] = Coordinate::new(8.4 + i as f64 * 0.001, 125.9);
        points
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_all_reach_disk() {
        for _ in 0..5 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("cache.json");
            let cache = Arc::new(RouteCache::open(&path, RouteCacheConfig::default()).unwrap());
            let provider = Arc::new(CountingProvider::default());

            let tasks: Vec<_> = (0..16)
                .map(|i| {
                    let cache = Arc::clone(&cache);
                    let provider = Arc::clone(&provider);
                    tokio::spawn(async move {
                        cache.get_or_compute(&from_origin(i), provider.as_ref()).await;
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(cache.len(), 16);

            let reopened = RouteCache::open(&path, RouteCacheConfig::default()).unwrap();
            assert_eq!(reopened.len(), 16);
        }
    }

    #[tokio::test]
    async fn test_store_purges_expired_entries() {
        let config = RouteCacheConfig {
            ttl: Duration::ZERO,
            ..RouteCacheConfig::default()
        };
        let cache = RouteCache::in_memory(config);
        let provider = CountingProvider::default();

        for i in 0..500 {
            cache.get_or_compute(&from_origin(i), &provider).await;
        }
        assert!(cache.len() <= 1, "expired routes kept: {}", cache.len());
    }

    #[test]
    fn test_size_limit_evicts_oldest() {
        let config = RouteCacheConfig {
            max_entries: 10,
            ..RouteCacheConfig::default()
        };
        let cache = RouteCache::in_memory(config);
        let start = Utc::now() - chrono::Duration::minutes(30);

        for i in 0..11 {
            let points = from_origin(i);
            let mut route = straight_line_route(&points);
            route.is_estimate_fallback = false;
            route.computed_at = start + chrono::Duration::minutes(i as i64);
            cache.store(cache_key(&points), route);
        }

        assert_eq!(cache.len(), 9);
        assert_eq!(cache.stats().evictions, 2);
        assert!(cache.get(&from_origin(0)).is_none());
        assert!(cache.get(&from_origin(1)).is_none());
        assert!(cache.get(&from_origin(10)).is_some());
    }
}
