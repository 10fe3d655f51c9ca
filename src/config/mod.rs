//! Configuration schemas and composition.
//!
//! Three layers compose into the effective config for any `(chain, path)`:
//! global defaults, per-chain overrides, and per-route overrides. Route
//! patterns and endpoint filters are `*`/`?` globs.

use crate::routing::load_balancer::Strategy;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod service;

pub use service::ConfigService;

/// Read an integer environment override, falling back on parse failure.
pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_port() -> u16 {
    3000
}

fn default_timeout_ms() -> u64 {
    env_u64("REQUEST_TIMEOUT", 10_000)
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_cacheable_post_prefixes() -> Vec<String> {
    ["abci_query", "block", "tx", "status", "validators"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Process-wide configuration, persisted as `config/global.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub sticky_sessions: bool,
    #[serde(default = "default_cacheable_post_prefixes")]
    pub cacheable_post_prefixes: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub crawler: CrawlerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            strategy: Strategy::default(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            cache_enabled: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            sticky_sessions: false,
            cacheable_post_prefixes: default_cacheable_post_prefixes(),
            routes: Vec::new(),
            crawler: CrawlerConfig::default(),
        }
    }
}

/// Per-chain overrides, persisted as `config/chains/{name}.json`.
/// `None` fields fall through to the global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    pub strategy: Option<Strategy>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub sticky_sessions: Option<bool>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Route-level overrides matched by a glob over the upstream path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Glob over the upstream path, e.g. `status*` or `tx?*`.
    pub path: String,
    pub strategy: Option<Strategy>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub sticky_sessions: Option<bool>,
    #[serde(default)]
    pub endpoint_whitelist: Vec<String>,
    #[serde(default)]
    pub endpoint_blacklist: Vec<String>,
    pub cacheable_post_prefixes: Option<Vec<String>>,
}

/// The composed policy the pipeline and balancer act on.
#[derive(Debug, Clone)]
pub struct EffectiveRouteConfig {
    /// The matched route glob, or `*` when no route matched. Balancer
    /// round-robin state is keyed by `(chain, route_pattern)`.
    pub route_pattern: String,
    pub strategy: Strategy,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_multiplier: f64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub sticky_sessions: bool,
    pub endpoint_whitelist: Vec<String>,
    pub endpoint_blacklist: Vec<String>,
    pub cacheable_post_prefixes: Vec<String>,
}

/// Crawler tuning, env-overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_crawler_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_crawler_retries")]
    pub retries: u32,
    #[serde(default = "default_crawler_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_crawler_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_main_concurrency")]
    pub main_concurrency: usize,
    #[serde(default = "default_peer_concurrency")]
    pub peer_concurrency: usize,
    #[serde(default = "default_chain_concurrency")]
    pub chain_concurrency: usize,
    #[serde(default = "default_chain_deadline_secs")]
    pub chain_deadline_secs: u64,
}

fn default_crawler_timeout_secs() -> u64 {
    env_u64("CRAWLER_TIMEOUT", 3)
}

fn default_crawler_retries() -> u32 {
    env_u64("CRAWLER_RETRIES", 1) as u32
}

fn default_crawler_retry_delay_ms() -> u64 {
    env_u64("CRAWLER_RETRY_DELAY", 500)
}

fn default_crawler_max_depth() -> u32 {
    env_u64("CRAWLER_MAX_DEPTH", 3) as u32
}

fn default_main_concurrency() -> usize {
    5
}

fn default_peer_concurrency() -> usize {
    10
}

fn default_chain_concurrency() -> usize {
    3
}

fn default_chain_deadline_secs() -> u64 {
    300
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_crawler_timeout_secs(),
            retries: default_crawler_retries(),
            retry_delay_ms: default_crawler_retry_delay_ms(),
            max_depth: default_crawler_max_depth(),
            main_concurrency: default_main_concurrency(),
            peer_concurrency: default_peer_concurrency(),
            chain_concurrency: default_chain_concurrency(),
            chain_deadline_secs: default_chain_deadline_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Glob matching. Wildcards `*` and `?`, anchored, case-insensitive.

static GLOB_CACHE: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    // The pattern is fully escaped above, so compilation cannot fail.
    Regex::new(&out).unwrap()
}

/// Match `input` against a `*`/`?` glob.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(re) = GLOB_CACHE.get(pattern) {
        return re.is_match(input);
    }
    let re = glob_to_regex(pattern);
    let matched = re.is_match(input);
    GLOB_CACHE.insert(pattern.to_string(), re);
    matched
}
