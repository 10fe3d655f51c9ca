//! Chain-registry client.
//!
//! Seeds and refreshes the catalog from the Cosmos chain-registry on
//! GitHub: the repository contents API lists chain directories, and each
//! chain's `chain.json` carries its id, bech32 prefix, and RPC seeds.
//! The directory listing is cached in the persistent tier to stay under
//! GitHub's unauthenticated rate limits; `GITHUB_PAT` raises them.

use crate::cache::{Tier, TieredCache};
use crate::crawler::filter::normalize_url;
use crate::error::{Error, Result};
use crate::routing::BalancerService;
use crate::storage::Storage;
use crate::types::{Chain, RegistryChain, RegistryDirEntry};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com/cosmos/chain-registry/master";
const DEFAULT_API_BASE: &str = "https://api.github.com/repos/cosmos/chain-registry/contents";
const CONTENTS_CACHE_KEY: &str = "registry:contents";
const FETCH_CONCURRENCY: usize = 8;

pub struct RegistryClient {
    client: reqwest::Client,
    raw_base: String,
    api_base: String,
    token: Option<String>,
    cache: Option<Arc<TieredCache>>,
    balancer: Option<Arc<BalancerService>>,
}

impl RegistryClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        Self::with_bases(DEFAULT_RAW_BASE, DEFAULT_API_BASE, token)
    }

    /// Base URLs are injectable so tests can point at a local double.
    pub fn with_bases(
        raw_base: impl Into<String>,
        api_base: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        // GitHub rejects requests without a User-Agent.
        let client = reqwest::Client::builder()
            .user_agent(concat!("chainlb/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            raw_base: raw_base.into(),
            api_base: api_base.into(),
            token,
            cache: None,
            balancer: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// With a balancer attached, merges write live endpoint counters
    /// back onto the catalog records they persist.
    pub fn with_balancer(mut self, balancer: Arc<BalancerService>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Chain directories at the registry root.
    pub async fn list_chains(&self) -> Result<Vec<String>> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(CONTENTS_CACHE_KEY) {
                if let Ok(names) = serde_json::from_slice::<Vec<String>>(&bytes) {
                    debug!("Registry listing served from cache");
                    return Ok(names);
                }
            }
        }

        let mut request = self.client.get(&self.api_base);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Registry(format!("contents listing: HTTP {}", resp.status())));
        }
        let entries: Vec<RegistryDirEntry> = resp.json().await?;

        let names: Vec<String> = entries
            .into_iter()
            .filter(|e| e.kind == "dir")
            .map(|e| e.name)
            .filter(|name| {
                !name.starts_with('.') && !name.starts_with('_') && name != "testnets"
            })
            .collect();

        if let Some(cache) = &self.cache {
            if let Ok(bytes) = serde_json::to_vec(&names) {
                cache.set_in(Tier::Persistent, CONTENTS_CACHE_KEY, bytes);
            }
        }
        Ok(names)
    }

    /// Fetch one chain's registry document.
    pub async fn fetch_chain(&self, name: &str) -> Result<RegistryChain> {
        let url = format!("{}/{}/chain.json", self.raw_base, name);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Registry(format!("{name}: HTTP {}", resp.status())));
        }
        Ok(resp.json().await?)
    }

    /// Fetch and merge one chain into the catalog. Known endpoints are
    /// never dropped; registry seeds are appended.
    pub async fn refresh_chain(&self, storage: &Arc<dyn Storage>, name: &str) -> Result<Chain> {
        let doc = self.fetch_chain(name).await?;
        let chain = merge_into_catalog(storage, self.balancer.as_deref(), doc).await?;
        Ok(chain)
    }

    /// Refresh the whole catalog. Individual chain failures are logged
    /// and skipped; a failed directory listing fails the refresh.
    pub async fn refresh_all(&self, storage: &Arc<dyn Storage>) -> Result<usize> {
        let names = self.list_chains().await?;
        info!(chains = names.len(), "Refreshing catalog from chain registry");

        let merged: Vec<()> = futures::stream::iter(names)
            .map(|name| async move {
                match self.refresh_chain(storage, &name).await {
                    Ok(_) => Some(()),
                    Err(e) => {
                        warn!(chain = %name, "Registry refresh skipped: {e}");
                        None
                    },
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        storage.save_chains().await?;
        Ok(merged.len())
    }
}

async fn merge_into_catalog(
    storage: &Arc<dyn Storage>,
    balancer: Option<&BalancerService>,
    doc: RegistryChain,
) -> Result<Chain> {
    let mut chain = storage
        .get_chain(&doc.chain_name)
        .await
        .unwrap_or_else(|| Chain::new(doc.chain_name.clone(), doc.chain_id.clone()));

    chain.chain_id = doc.chain_id;
    if !doc.bech32_prefix.is_empty() {
        chain.bech32_prefix = doc.bech32_prefix;
    }
    for rpc in &doc.apis.rpc {
        if let Some(url) = normalize_url(&rpc.address) {
            chain.add_endpoint(&url);
        }
    }
    chain.last_updated = Utc::now();
    if let Some(balancer) = balancer {
        balancer.apply_stats(&mut chain);
    }

    storage.upsert_chain(chain.clone()).await?;
    Ok(chain)
}
