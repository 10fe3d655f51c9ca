//! Shared data model: the endpoint catalog, the typed wire shapes the
//! crawler validates, and the documents exchanged with the chain registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub fn default_chain_timeout_ms() -> u64 {
    crate::config::env_u64("REQUEST_TIMEOUT", 10_000)
}

fn default_weight() -> f64 {
    1.0
}

/// A blockchain network and its known RPC endpoints.
///
/// `chain_id` is authoritative: an endpoint advertising a different id is
/// reassigned to the owning chain (if known) or dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub chain_name: String,
    pub chain_id: String,
    #[serde(default)]
    pub bech32_prefix: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_crawled: Option<DateTime<Utc>>,
    #[serde(default = "default_chain_timeout_ms")]
    pub timeout_ms: u64,
}

impl Chain {
    pub fn new(chain_name: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            chain_name: chain_name.into(),
            chain_id: chain_id.into(),
            bech32_prefix: String::new(),
            endpoints: Vec::new(),
            last_updated: Utc::now(),
            last_crawled: None,
            timeout_ms: default_chain_timeout_ms(),
        }
    }

    /// True if the catalog already holds `url` (normalized comparison).
    pub fn has_endpoint(&self, url: &str) -> bool {
        self.endpoints.iter().any(|e| e.url.eq_ignore_ascii_case(url))
    }

    /// Append a normalized base URL, preserving insertion order.
    /// Returns false when the URL is already present.
    pub fn add_endpoint(&mut self, url: &str) -> bool {
        if self.has_endpoint(url) {
            return false;
        }
        self.endpoints.push(Endpoint::new(url));
        true
    }
}

/// One RPC base URL owned by a chain, with its persisted health counters.
///
/// Live counters are maintained by the balancer; every persistence path
/// (crawler flush, registry merge, admin add) copies them back onto
/// these fields via `BalancerService::apply_stats` before the record is
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub response_time_ms: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success_count: 0,
            failure_count: 0,
            response_time_ms: 0.0,
            weight: default_weight(),
            last_seen: None,
        }
    }
}

/// Soft-ban record for a hostname. Promoted to the rejected set once the
/// failure count crosses the rejection cutoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub failure_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            failure_count: 1,
            first_seen: now,
            last_seen: now,
        }
    }
}

impl Default for BlacklistEntry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Wire shapes the crawler validates. Required fields are not optional on
// purpose: a missing field fails the deserialize and the endpoint check.

/// `/status` response, reduced to the fields the health gate needs.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub result: StatusResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResult {
    pub node_info: StatusNodeInfo,
    pub sync_info: SyncInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusNodeInfo {
    /// Advertised chain id.
    pub network: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncInfo {
    pub latest_block_time: DateTime<Utc>,
}

/// `/net_info` response carrying the peer listing.
#[derive(Debug, Clone, Deserialize)]
pub struct NetInfoResponse {
    pub result: NetInfoResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetInfoResult {
    #[serde(default)]
    pub peers: Vec<Peer>,
}

/// One gossiped peer. Address fields are individually optional; the union
/// of the three is what the crawler expands.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Peer {
    #[serde(default)]
    pub node_info: Option<PeerNodeInfo>,
    #[serde(default)]
    pub remote_ip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerNodeInfo {
    #[serde(default)]
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub other: PeerNodeInfoOther,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerNodeInfoOther {
    #[serde(default)]
    pub rpc_address: Option<String>,
}

// ---------------------------------------------------------------------------
// Chain-registry documents.

/// Subset of a chain-registry `chain.json` the catalog ingests.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryChain {
    pub chain_name: String,
    pub chain_id: String,
    #[serde(default)]
    pub bech32_prefix: String,
    #[serde(default)]
    pub apis: RegistryApis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryApis {
    #[serde(default)]
    pub rpc: Vec<RegistryEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEndpoint {
    pub address: String,
}

/// One entry of the GitHub contents listing for the registry root.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

// ---------------------------------------------------------------------------
// API payloads.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddChainRequest {
    pub chain_name: String,
    pub chain_id: String,
    pub rpc_addresses: Vec<String>,
    #[serde(default)]
    pub bech32_prefix: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub chain_name: String,
    pub chain_id: String,
    pub endpoint_count: usize,
    pub last_updated: DateTime<Utc>,
    pub last_crawled: Option<DateTime<Utc>>,
}

impl From<&Chain> for ChainSummary {
    fn from(chain: &Chain) -> Self {
        Self {
            chain_name: chain.chain_name.clone(),
            chain_id: chain.chain_id.clone(),
            endpoint_count: chain.endpoints.len(),
            last_updated: chain.last_updated,
            last_crawled: chain.last_crawled,
        }
    }
}

/// Per-chain crawl outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    pub chain_name: String,
    pub new_endpoints: usize,
    pub total_endpoints: usize,
    pub misplaced_endpoints: usize,
}
