//! Load balancing over a chain's endpoint set.
//!
//! Selection runs a filter pipeline (route glob filters, breaker gate,
//! rejected hosts) and then dispatches on the route's strategy:
//! round-robin, weighted, least-connections, random, or ip-hash.
//! Endpoint statistics (EWMA latency, success counters, derived weight)
//! are shared across routes and keyed by URL.

use crate::cache::{Tier, TieredCache};
use crate::config::{glob_match, ConfigService, EffectiveRouteConfig};
use crate::crawler::filter::host_of;
use crate::error::{Error, Result};
use crate::health::circuit_breaker::{CircuitBreakerManager, CircuitState};
use crate::storage::Storage;
use crate::types::Chain;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Selection strategy for a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
    IpHash,
}

const MAX_LATENCY_MS: f64 = 5000.0;
const EWMA_KEEP: f64 = 0.8;
const EWMA_OBSERVE: f64 = 0.2;

#[derive(Debug)]
struct StatsInner {
    success_count: u64,
    failure_count: u64,
    response_time_ms: f64,
    weight: f64,
    last_seen: Option<DateTime<Utc>>,
}

/// Live per-URL statistics. The mutex guards the EWMA/weight update so a
/// snapshot never observes a half-applied result; in-flight tracking is
/// a plain atomic.
pub struct EndpointStats {
    inner: Mutex<StatsInner>,
    in_flight: AtomicUsize,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                success_count: 0,
                failure_count: 0,
                response_time_ms: 0.0,
                weight: 1.0,
                last_seen: None,
            }),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn record(&self, latency_ms: f64, ok: bool) {
        let mut s = self.inner.lock();
        if ok {
            s.success_count += 1;
            s.last_seen = Some(Utc::now());
        } else {
            s.failure_count += 1;
        }

        s.response_time_ms = if s.response_time_ms > 0.0 {
            EWMA_KEEP * s.response_time_ms + EWMA_OBSERVE * latency_ms
        } else {
            latency_ms
        };

        let total = (s.success_count + s.failure_count) as f64;
        let success_rate = s.success_count as f64 / total;
        let norm_latency = s.response_time_ms.min(MAX_LATENCY_MS) / MAX_LATENCY_MS;
        s.weight = (0.7 * success_rate + 0.3 * (1.0 - norm_latency)).clamp(0.0, 1.0);
    }

    fn weight(&self) -> f64 {
        self.inner.lock().weight
    }
}

/// Point-in-time view of one endpoint, merged from live stats and
/// breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub url: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub response_time_ms: f64,
    pub weight: f64,
    pub in_flight: usize,
    pub breaker: Option<CircuitState>,
    pub last_seen: Option<DateTime<Utc>>,
}

type RouteKey = (String, String);

pub struct BalancerService {
    storage: Arc<dyn Storage>,
    breakers: Arc<CircuitBreakerManager>,
    cache: Arc<TieredCache>,
    config: Arc<ConfigService>,
    stats: DashMap<String, Arc<EndpointStats>>,
    rr_counters: DashMap<RouteKey, Arc<AtomicUsize>>,
}

impl BalancerService {
    pub fn new(
        storage: Arc<dyn Storage>,
        breakers: Arc<CircuitBreakerManager>,
        cache: Arc<TieredCache>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            storage,
            breakers,
            cache,
            config,
            stats: DashMap::new(),
            rr_counters: DashMap::new(),
        }
    }

    /// Select one endpoint URL for `(chain, path)`.
    pub async fn select(
        &self,
        chain_name: &str,
        path: &str,
        client_ip: Option<&str>,
    ) -> Result<String> {
        let chain = self
            .storage
            .get_chain(chain_name)
            .await
            .ok_or_else(|| Error::UnknownChain(chain_name.to_string()))?;
        let route = self.config.effective_route(chain_name, path);
        self.select_from(&chain, &route, client_ip, &HashSet::new())
    }

    /// Selection against an already-resolved chain and route. `exclude`
    /// removes endpoints the caller has already tried this request.
    pub fn select_from(
        &self,
        chain: &Chain,
        route: &EffectiveRouteConfig,
        client_ip: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<String> {
        let candidates = self.filtered(chain, route, exclude);
        if candidates.is_empty() {
            return Err(Error::NoAvailableEndpoint(chain.chain_name.clone()));
        }

        if route.sticky_sessions {
            if let Some(ip) = client_ip {
                return Ok(self.sticky_select(chain, route, ip, &candidates));
            }
        }

        Ok(self.dispatch(chain, route, &candidates, client_ip))
    }

    /// Filter pipeline: route glob filters over the host, breaker gate,
    /// rejected hosts, caller exclusions. Insertion order is preserved.
    fn filtered(
        &self,
        chain: &Chain,
        route: &EffectiveRouteConfig,
        exclude: &HashSet<String>,
    ) -> Vec<String> {
        chain
            .endpoints
            .iter()
            .map(|e| e.url.clone())
            .filter(|url| {
                let host = match host_of(url) {
                    Some(host) => host,
                    None => return false,
                };
                if !route.endpoint_whitelist.is_empty()
                    && !route.endpoint_whitelist.iter().any(|p| glob_match(p, &host))
                {
                    return false;
                }
                if route.endpoint_blacklist.iter().any(|p| glob_match(p, &host)) {
                    return false;
                }
                if !self.breakers.available(url) {
                    return false;
                }
                if self.storage.is_rejected(&host) {
                    return false;
                }
                !exclude.contains(url)
            })
            .collect()
    }

    fn sticky_select(
        &self,
        chain: &Chain,
        route: &EffectiveRouteConfig,
        ip: &str,
        candidates: &[String],
    ) -> String {
        let session_key = format!("session:{}:{:016x}", chain.chain_name, xxh3_64(ip.as_bytes()));

        if let Some(bytes) = self.cache.get(&session_key) {
            if let Ok(url) = String::from_utf8(bytes) {
                if candidates.contains(&url) {
                    debug!(chain = %chain.chain_name, %url, "Sticky session hit");
                    return url;
                }
            }
        }

        // Stored choice missing or unhealthy; select fresh and rewrite.
        let url = self.dispatch(chain, route, candidates, Some(ip));
        self.cache.set_in(Tier::Session, &session_key, url.clone().into_bytes());
        url
    }

    fn dispatch(
        &self,
        chain: &Chain,
        route: &EffectiveRouteConfig,
        candidates: &[String],
        client_ip: Option<&str>,
    ) -> String {
        let index = match route.strategy {
            Strategy::RoundRobin => {
                let counter = self
                    .rr_counters
                    .entry((chain.chain_name.clone(), route.route_pattern.clone()))
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                    .clone();
                counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
            },
            Strategy::Weighted => {
                let weights: Vec<f64> = candidates.iter().map(|u| self.weight_of(u)).collect();
                weighted_index(&weights, rand::thread_rng().gen::<f64>())
            },
            Strategy::LeastConnections => self.least_connections_index(candidates),
            Strategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            Strategy::IpHash => {
                let ip = client_ip.unwrap_or("");
                (xxh3_64(ip.as_bytes()) % candidates.len() as u64) as usize
            },
        };
        candidates[index].clone()
    }

    fn least_connections_index(&self, candidates: &[String]) -> usize {
        let mut best = 0;
        let mut best_in_flight = self.in_flight_of(&candidates[0]);
        let mut best_weight = self.weight_of(&candidates[0]);

        for (i, url) in candidates.iter().enumerate().skip(1) {
            let in_flight = self.in_flight_of(url);
            let weight = self.weight_of(url);
            if in_flight < best_in_flight || (in_flight == best_in_flight && weight > best_weight)
            {
                best = i;
                best_in_flight = in_flight;
                best_weight = weight;
            }
        }
        best
    }

    fn stats_of(&self, url: &str) -> Arc<EndpointStats> {
        self.stats
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(EndpointStats::new()))
            .clone()
    }

    fn weight_of(&self, url: &str) -> f64 {
        self.stats.get(url).map(|s| s.weight()).unwrap_or(1.0)
    }

    fn in_flight_of(&self, url: &str) -> usize {
        self.stats
            .get(url)
            .map(|s| s.in_flight.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Mark a request in flight; pair with [`end_request`].
    pub fn begin_request(&self, url: &str) {
        self.stats_of(url).in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self, url: &str) {
        let stats = self.stats_of(url);
        // Saturating: a restart mid-request must not wrap.
        let _ = stats
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record an observed latency and outcome for an endpoint.
    pub fn record_result(&self, url: &str, latency_ms: f64, ok: bool) {
        self.stats_of(url).record(latency_ms, ok);
    }

    /// Per-endpoint stats for a chain, insertion-ordered.
    pub fn snapshot(&self, chain: &Chain) -> Vec<EndpointSnapshot> {
        chain
            .endpoints
            .iter()
            .map(|e| {
                let url = e.url.clone();
                let breaker = self.breakers.state(&url);
                match self.stats.get(&url) {
                    Some(stats) => {
                        let inner = stats.inner.lock();
                        EndpointSnapshot {
                            url,
                            success_count: inner.success_count,
                            failure_count: inner.failure_count,
                            response_time_ms: inner.response_time_ms,
                            weight: inner.weight,
                            in_flight: stats.in_flight.load(Ordering::Relaxed),
                            breaker,
                            last_seen: inner.last_seen,
                        }
                    },
                    // Not yet exercised: fall back to the persisted counters.
                    None => EndpointSnapshot {
                        url,
                        success_count: e.success_count,
                        failure_count: e.failure_count,
                        response_time_ms: e.response_time_ms,
                        weight: e.weight,
                        in_flight: 0,
                        breaker,
                        last_seen: e.last_seen,
                    },
                }
            })
            .collect()
    }

    /// Copy live counters back onto a catalog record before persisting.
    pub fn apply_stats(&self, chain: &mut Chain) {
        for endpoint in &mut chain.endpoints {
            if let Some(stats) = self.stats.get(&endpoint.url) {
                let inner = stats.inner.lock();
                endpoint.success_count = inner.success_count;
                endpoint.failure_count = inner.failure_count;
                endpoint.response_time_ms = inner.response_time_ms;
                endpoint.weight = inner.weight;
                endpoint.last_seen = inner.last_seen;
            }
        }
    }
}

/// Walk endpoints accumulating weight until the scaled threshold is
/// crossed. `unit` is a uniform sample in `[0, 1)`; ties resolve to the
/// earlier endpoint.
fn weighted_index(weights: &[f64], unit: f64) -> usize {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0;
    }
    let mut threshold = unit * total;
    for (i, w) in weights.iter().enumerate() {
        if threshold < *w {
            return i;
        }
        threshold -= w;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::health::circuit_breaker::CircuitBreakerConfig;
    use crate::storage::FileStorage;
    use proptest::prelude::*;
    use std::time::Duration;
    use super::Strategy;

    async fn service() -> (BalancerService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::open(dir.path().join("data")).await.unwrap());
        let config = ConfigService::load(dir.path().join("config")).await.unwrap();
        let cache = Arc::new(TieredCache::new(Duration::from_secs(60)));
        let breakers = Arc::new(CircuitBreakerManager::default());
        (
            BalancerService::new(storage, breakers, cache, config),
            dir,
        )
    }

    fn chain_with(urls: &[&str]) -> Chain {
        let mut chain = Chain::new("testchain", "testchain-1");
        for url in urls {
            chain.add_endpoint(url);
        }
        chain
    }

    fn route(strategy: Strategy) -> EffectiveRouteConfig {
        EffectiveRouteConfig {
            route_pattern: "*".to_string(),
            strategy,
            timeout_ms: 10_000,
            retries: 3,
            backoff_multiplier: 2.0,
            cache_enabled: true,
            cache_ttl_secs: 60,
            sticky_sessions: false,
            endpoint_whitelist: Vec::new(),
            endpoint_blacklist: Vec::new(),
            cacheable_post_prefixes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_in_insertion_order() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a", "https://b", "https://c"]);
        let route = route(Strategy::RoundRobin);
        let none = HashSet::new();

        let picks: Vec<String> = (0..4)
            .map(|_| svc.select_from(&chain, &route, None, &none).unwrap())
            .collect();
        assert_eq!(picks, ["https://a", "https://b", "https://c", "https://a"]);
    }

    #[test]
    fn weighted_walk_matches_reference_samples() {
        // Weights [1.0, 0.5, 0.5]: 0.4 -> a, 0.6 -> b, 0.8 -> c.
        let weights = [1.0, 0.5, 0.5];
        assert_eq!(weighted_index(&weights, 0.4), 0);
        assert_eq!(weighted_index(&weights, 0.6), 1);
        assert_eq!(weighted_index(&weights, 0.8), 2);
    }

    #[test]
    fn weighted_walk_boundaries() {
        let weights = [1.0, 1.0];
        assert_eq!(weighted_index(&weights, 0.0), 0);
        assert_eq!(weighted_index(&weights, 0.5), 1);
        assert_eq!(weighted_index(&[0.0, 0.0], 0.7), 0);
    }

    #[tokio::test]
    async fn ewma_and_counters() {
        let (svc, _dir) = service().await;
        svc.record_result("https://a", 100.0, true);
        {
            let stats = svc.stats.get("https://a").unwrap();
            assert!((stats.inner.lock().response_time_ms - 100.0).abs() < 1e-9);
        }
        svc.record_result("https://a", 200.0, false);
        let stats = svc.stats.get("https://a").unwrap();
        let inner = stats.inner.lock();
        assert!((inner.response_time_ms - 120.0).abs() < 1e-9);
        assert_eq!(inner.success_count, 1);
        assert_eq!(inner.failure_count, 1);
    }

    #[tokio::test]
    async fn open_breaker_is_filtered_out() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a", "https://b"]);
        let route = route(Strategy::RoundRobin);
        let none = HashSet::new();

        for _ in 0..3 {
            svc.breakers.record("https://a", false);
        }

        for _ in 0..3 {
            let pick = svc.select_from(&chain, &route, None, &none).unwrap();
            assert_eq!(pick, "https://b");
        }
    }

    #[tokio::test]
    async fn all_filtered_is_no_available_endpoint() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a"]);
        let mut route = route(Strategy::RoundRobin);
        route.endpoint_blacklist = vec!["*".to_string()];

        let err = svc.select_from(&chain, &route, None, &HashSet::new()).unwrap_err();
        assert!(matches!(err, Error::NoAvailableEndpoint(_)));
    }

    #[tokio::test]
    async fn whitelist_globs_filter_hosts() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://rpc.keep.zone", "https://rpc.other.zone"]);
        let mut route = route(Strategy::RoundRobin);
        route.endpoint_whitelist = vec!["*.keep.zone".to_string()];
        let none = HashSet::new();

        for _ in 0..2 {
            let pick = svc.select_from(&chain, &route, None, &none).unwrap();
            assert_eq!(pick, "https://rpc.keep.zone");
        }
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_then_weight() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a", "https://b"]);
        let route = route(Strategy::LeastConnections);
        let none = HashSet::new();

        svc.begin_request("https://a");
        let pick = svc.select_from(&chain, &route, None, &none).unwrap();
        assert_eq!(pick, "https://b");

        svc.end_request("https://a");
        // Equal in-flight: higher weight wins.
        svc.record_result("https://a", 100.0, true);
        svc.record_result("https://b", 100.0, false);
        let pick = svc.select_from(&chain, &route, None, &none).unwrap();
        assert_eq!(pick, "https://a");
    }

    #[tokio::test]
    async fn ip_hash_is_deterministic() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a", "https://b", "https://c"]);
        let route = route(Strategy::IpHash);
        let none = HashSet::new();

        let first = svc.select_from(&chain, &route, Some("8.8.8.8"), &none).unwrap();
        for _ in 0..5 {
            let again = svc.select_from(&chain, &route, Some("8.8.8.8"), &none).unwrap();
            assert_eq!(first, again);
        }
    }

    #[tokio::test]
    async fn sticky_sessions_pin_and_recover() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a", "https://b", "https://c"]);
        let mut route = route(Strategy::Random);
        route.sticky_sessions = true;
        let none = HashSet::new();

        let first = svc.select_from(&chain, &route, Some("1.2.3.4"), &none).unwrap();
        for _ in 0..5 {
            let again = svc.select_from(&chain, &route, Some("1.2.3.4"), &none).unwrap();
            assert_eq!(first, again);
        }

        // Pinned endpoint trips its breaker: selection falls through and
        // the session is rewritten to a healthy endpoint.
        for _ in 0..3 {
            svc.breakers.record(&first, false);
        }
        let replacement = svc.select_from(&chain, &route, Some("1.2.3.4"), &none).unwrap();
        assert_ne!(replacement, first);
        let again = svc.select_from(&chain, &route, Some("1.2.3.4"), &none).unwrap();
        assert_eq!(replacement, again);
    }

    #[tokio::test]
    async fn snapshot_merges_live_and_persisted() {
        let (svc, _dir) = service().await;
        let chain = chain_with(&["https://a", "https://b"]);
        svc.record_result("https://a", 50.0, true);

        let snap = svc.snapshot(&chain);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].success_count, 1);
        assert_eq!(snap[1].success_count, 0);
    }

    proptest! {
        #[test]
        fn weight_stays_in_unit_interval(
            outcomes in proptest::collection::vec((0.0f64..20_000.0, any::<bool>()), 1..200)
        ) {
            let stats = EndpointStats::new();
            for (latency, ok) in outcomes {
                stats.record(latency, ok);
                let w = stats.weight();
                prop_assert!((0.0..=1.0).contains(&w));
            }
        }
    }
}
