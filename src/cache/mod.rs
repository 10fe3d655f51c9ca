//! Four-tier TTL cache.
//!
//! Tiers share a uniform `(key -> value, expiry)` contract:
//! - **main** (60s default): general proxied responses
//! - **persistent** (1h): chain and rpc listings
//! - **session** (5min): sticky-session mappings
//! - **metrics** (1min): stat snapshots
//!
//! Writes pick a tier and TTL from the first matching key pattern; reads
//! check main, persistent, session, metrics in order and return the first
//! non-expired hit. A periodic sweep prunes expired entries.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Main,
    Persistent,
    Session,
    Metrics,
}

pub const SESSION_TTL: Duration = Duration::from_secs(300);
const PERSISTENT_TTL: Duration = Duration::from_secs(3600);
const METRICS_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Write rules, first match wins: key pattern, target tier, TTL seconds.
static WRITE_RULES: Lazy<Vec<(Regex, Tier, u64)>> = Lazy::new(|| {
    [
        (r"^chain:list", Tier::Main, 300),
        (r"^chain:summary", Tier::Main, 300),
        (r"^rpc:list", Tier::Main, 300),
        (r"^tx:", Tier::Main, 3600),
        (r"^block:\d+$", Tier::Main, 3600),
        (r"^validators", Tier::Main, 300),
        (r"^status", Tier::Main, 60),
        (r"^metrics", Tier::Metrics, 60),
    ]
    .iter()
    .map(|(p, t, ttl)| (Regex::new(p).unwrap(), *t, *ttl))
    .collect()
});

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

struct TierMap {
    name: &'static str,
    map: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TierMap {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            map: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.map.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.map.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: String, value: Vec<u8>, ttl: Duration) {
        self.map.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        before - self.map.len()
    }

    fn stats(&self) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        TierStats {
            tier: self.name.to_string(),
            size: self.map.len(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

/// The four tiers behind one handle.
pub struct TieredCache {
    main: TierMap,
    persistent: TierMap,
    session: TierMap,
    metrics: TierMap,
    default_ttl: Duration,
}

impl TieredCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            main: TierMap::new("main"),
            persistent: TierMap::new("persistent"),
            session: TierMap::new("session"),
            metrics: TierMap::new("metrics"),
            default_ttl,
        }
    }

    fn tier(&self, tier: Tier) -> &TierMap {
        match tier {
            Tier::Main => &self.main,
            Tier::Persistent => &self.persistent,
            Tier::Session => &self.session,
            Tier::Metrics => &self.metrics,
        }
    }

    fn tiers(&self) -> [&TierMap; 4] {
        [&self.main, &self.persistent, &self.session, &self.metrics]
    }

    /// Read-through lookup across all tiers.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        for tier in self.tiers() {
            if let Some(value) = tier.get(key) {
                return Some(value);
            }
        }
        None
    }

    /// Store under the tier and TTL selected by the key pattern table.
    /// `fallback_ttl` applies when no pattern matches (route-level TTL);
    /// with none, the main tier's default TTL is used.
    pub fn set(&self, key: &str, value: Vec<u8>, fallback_ttl: Option<Duration>) {
        let (tier, ttl) = classify(key)
            .map(|(t, secs)| (t, Duration::from_secs(secs)))
            .unwrap_or((Tier::Main, fallback_ttl.unwrap_or(self.default_ttl)));
        self.tier(tier).set(key.to_string(), value, ttl);
    }

    /// Store directly into a tier with its default TTL.
    pub fn set_in(&self, tier: Tier, key: &str, value: Vec<u8>) {
        let ttl = match tier {
            Tier::Main => self.default_ttl,
            Tier::Persistent => PERSISTENT_TTL,
            Tier::Session => SESSION_TTL,
            Tier::Metrics => METRICS_TTL,
        };
        self.tier(tier).set(key.to_string(), value, ttl);
    }

    /// Remove a key from every tier.
    pub fn delete(&self, key: &str) {
        for tier in self.tiers() {
            tier.map.remove(key);
        }
    }

    /// Drop entries whose keys match `pattern`; with none, clear all tiers.
    /// Returns the number of removed entries.
    pub fn flush(&self, pattern: Option<&Regex>) -> usize {
        let mut removed = 0;
        for tier in self.tiers() {
            match pattern {
                Some(re) => {
                    let before = tier.map.len();
                    tier.map.retain(|key, _| !re.is_match(key));
                    removed += before - tier.map.len();
                },
                None => {
                    removed += tier.map.len();
                    tier.map.clear();
                },
            }
        }
        info!(removed, "Cache flush");
        removed
    }

    /// Prune expired entries across all tiers.
    pub fn sweep(&self) -> usize {
        let pruned: usize = self.tiers().iter().map(|t| t.sweep()).sum();
        if pruned > 0 {
            debug!(pruned, "Cache sweep");
        }
        pruned
    }

    /// Run the sweep on an interval until the handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    },
                    None => break,
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tiers: self.tiers().iter().map(|t| t.stats()).collect(),
        }
    }
}

/// Tier and TTL for keys the write-rule table recognizes.
///
/// Proxied responses are keyed `chain:METHOD:path`; for those the rules
/// are also tried against the path portion so `tx:`/`block:` style
/// upstream paths pick up their immutable TTLs.
fn classify(key: &str) -> Option<(Tier, u64)> {
    let lookup = |candidate: &str| {
        WRITE_RULES
            .iter()
            .find(|(re, _, _)| re.is_match(candidate))
            .map(|(_, tier, ttl)| (*tier, *ttl))
    };

    if let Some(found) = lookup(key) {
        return Some(found);
    }
    let mut parts = key.splitn(3, ':');
    if let (Some(_), Some(_), Some(path)) = (parts.next(), parts.next(), parts.next()) {
        return lookup(path);
    }
    None
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: String,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tiers: Vec<TierStats>,
}
