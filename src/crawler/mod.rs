//! Peer-discovery crawler.
//!
//! Extends each chain's endpoint set by walking the peer graph exposed
//! at `/net_info`, validating candidates at `/status` (identity and
//! block freshness), and probing candidate ports. Traversal is
//! breadth-first with bounded concurrency and a hard per-chain
//! wall-clock budget; catalog and IP sets are flushed periodically and
//! once more on the way out.

pub mod filter;

use crate::config::CrawlerConfig;
use crate::error::{Error, Result};
use crate::health::circuit_breaker::CircuitBreakerManager;
use crate::routing::BalancerService;
use crate::storage::Storage;
use crate::types::{Chain, CrawlSummary, NetInfoResponse, Peer, StatusResponse};
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stale gate: an endpoint whose latest block is older than this is invalid.
const BLOCK_FRESHNESS_SECS: i64 = 60;

/// Persist the catalog after this many newly discovered endpoints.
const FLUSH_EVERY: usize = 10;

pub struct Crawler {
    client: reqwest::Client,
    storage: Arc<dyn Storage>,
    breakers: Arc<CircuitBreakerManager>,
    balancer: Arc<BalancerService>,
    config: CrawlerConfig,
}

enum CheckOutcome {
    Valid { network: String, peers: Vec<Peer> },
    Invalid { reason: String },
    Skipped,
}

struct UrlReport {
    url: String,
    depth: u32,
    outcome: CheckOutcome,
}

struct CrawlState {
    chain: Chain,
    queue: VecDeque<(String, u32)>,
    processed: HashSet<String>,
    new_endpoints: usize,
    misplaced: usize,
}

impl CrawlState {
    fn new(chain: Chain) -> Self {
        let mut queue = VecDeque::new();
        let mut processed = HashSet::new();
        for endpoint in &chain.endpoints {
            if let Some(url) = filter::normalize_url(&endpoint.url) {
                if processed.insert(url.clone()) {
                    queue.push_back((url, 0));
                }
            }
        }
        Self {
            chain,
            queue,
            processed,
            new_endpoints: 0,
            misplaced: 0,
        }
    }
}

impl Crawler {
    pub fn new(
        storage: Arc<dyn Storage>,
        breakers: Arc<CircuitBreakerManager>,
        balancer: Arc<BalancerService>,
        config: CrawlerConfig,
    ) -> Result<Self> {
        // Chain operators frequently run self-signed certs.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            storage,
            breakers,
            balancer,
            config,
        })
    }

    /// Crawl every chain in the catalog, bounded chains in parallel.
    pub async fn crawl_all(&self) -> Vec<CrawlSummary> {
        let names: Vec<String> = self
            .storage
            .chains()
            .await
            .into_iter()
            .map(|c| c.chain_name)
            .collect();
        info!(chains = names.len(), "Starting network crawl");

        futures::stream::iter(names)
            .map(|name| async move {
                match self.crawl_chain(&name).await {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        warn!(chain = %name, "Crawl failed: {e}");
                        None
                    },
                }
            })
            .buffer_unordered(self.config.chain_concurrency.max(1))
            .filter_map(|s| async move { s })
            .collect()
            .await
    }

    /// Crawl one chain under its wall-clock budget. The final flush runs
    /// whether or not the deadline fired.
    pub async fn crawl_chain(&self, name: &str) -> Result<CrawlSummary> {
        let chain = self
            .storage
            .get_chain(name)
            .await
            .ok_or_else(|| Error::UnknownChain(name.to_string()))?;

        let mut state = CrawlState::new(chain);
        let deadline = Duration::from_secs(self.config.chain_deadline_secs);
        if tokio::time::timeout(deadline, self.traverse(&mut state))
            .await
            .is_err()
        {
            warn!(chain = name, "Crawl hit the per-chain deadline");
        }

        state.chain.last_crawled = Some(Utc::now());
        self.flush(&state).await?;

        let summary = CrawlSummary {
            chain_name: state.chain.chain_name.clone(),
            new_endpoints: state.new_endpoints,
            total_endpoints: state.chain.endpoints.len(),
            misplaced_endpoints: state.misplaced,
        };
        info!(
            chain = name,
            new = summary.new_endpoints,
            total = summary.total_endpoints,
            misplaced = summary.misplaced_endpoints,
            "Crawl finished"
        );
        Ok(summary)
    }

    async fn traverse(&self, state: &mut CrawlState) {
        loop {
            let mut batch = Vec::new();
            while batch.len() < self.config.main_concurrency.max(1) {
                match state.queue.pop_front() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let checks = batch.into_iter().map(|(url, depth)| async move {
                let outcome = self.check_url(&url).await;
                UrlReport { url, depth, outcome }
            });
            let reports = futures::future::join_all(checks).await;

            for report in reports {
                self.apply(state, report).await;
            }
        }
    }

    async fn apply(&self, state: &mut CrawlState, report: UrlReport) {
        match report.outcome {
            CheckOutcome::Valid { network, peers } => {
                if let Some(host) = filter::host_of(&report.url) {
                    self.storage.mark_good(&host);
                }

                if network == state.chain.chain_id {
                    if state.chain.add_endpoint(&report.url) {
                        state.new_endpoints += 1;
                        info!(chain = %state.chain.chain_name, url = %report.url, "New endpoint");
                        if state.new_endpoints % FLUSH_EVERY == 0 {
                            if let Err(e) = self.flush(state).await {
                                warn!("Mid-crawl flush failed: {e}");
                            }
                        }
                    }
                } else if let Some(mut owner) = self.find_chain_by_id(&network).await {
                    // Answers fine but belongs to a different known chain.
                    if owner.add_endpoint(&report.url) {
                        state.misplaced += 1;
                        info!(
                            url = %report.url,
                            advertised = %network,
                            owner = %owner.chain_name,
                            "Misplaced endpoint reassigned"
                        );
                        self.balancer.apply_stats(&mut owner);
                        if let Err(e) = self.storage.upsert_chain(owner).await {
                            warn!("Failed to persist misplaced endpoint: {e}");
                        }
                    }
                } else {
                    debug!(url = %report.url, advertised = %network, "Endpoint for unknown chain");
                }

                if report.depth < self.config.max_depth {
                    for url in self.expand_peers(&peers).await {
                        if state.processed.insert(url.clone()) {
                            state.queue.push_back((url, report.depth + 1));
                        }
                    }
                }
            },
            CheckOutcome::Invalid { reason } => {
                if let Some(host) = filter::host_of(&report.url) {
                    let count = self.storage.record_host_failure(&host);
                    debug!(url = %report.url, failures = count, "Invalid endpoint: {reason}");
                }
            },
            CheckOutcome::Skipped => {},
        }
    }

    /// Breaker-gated `/status` check with the identity and freshness
    /// gates, plus the `/net_info` peer fetch on success.
    async fn check_url(&self, url: &str) -> CheckOutcome {
        let breaker = self.breakers.get_or_create(url);
        if !breaker.should_allow() {
            return CheckOutcome::Skipped;
        }

        match self.fetch_status(url).await {
            Ok(status) => {
                let age = (Utc::now() - status.result.sync_info.latest_block_time)
                    .num_seconds()
                    .abs();
                if age > BLOCK_FRESHNESS_SECS {
                    breaker.record(false);
                    return CheckOutcome::Invalid {
                        reason: format!("stale block time ({age}s behind)"),
                    };
                }
                breaker.record(true);
                let peers = self.fetch_peers(url).await.unwrap_or_default();
                CheckOutcome::Valid {
                    network: status.result.node_info.network,
                    peers,
                }
            },
            Err(e) => {
                breaker.record(false);
                CheckOutcome::Invalid {
                    reason: e.to_string(),
                }
            },
        }
    }

    async fn fetch_status(&self, url: &str) -> Result<StatusResponse> {
        let mut last_err = None;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
            match self.try_status(url).await {
                Ok(status) => return Ok(status),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Upstream("status fetch".to_string())))
    }

    async fn try_status(&self, url: &str) -> Result<StatusResponse> {
        let resp = self.client.get(format!("{url}/status")).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!("HTTP {}", resp.status())));
        }
        Ok(resp.json::<StatusResponse>().await?)
    }

    async fn fetch_peers(&self, url: &str) -> Result<Vec<Peer>> {
        let resp = self.client.get(format!("{url}/net_info")).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!("HTTP {}", resp.status())));
        }
        Ok(resp.json::<NetInfoResponse>().await?.result.peers)
    }

    /// Turn a peer listing into probe URLs: address union, routable-host
    /// filter, rejected-set gate, port cross-product, and a TCP
    /// reachability probe bounded by the peer concurrency.
    async fn expand_peers(&self, peers: &[Peer]) -> Vec<String> {
        let (hosts, found_ports) = collect_peer_hosts(peers);
        if !found_ports.is_empty() {
            self.storage.add_ports(&found_ports);
        }

        let ports = self.storage.ports();
        let candidates: Vec<String> = hosts
            .iter()
            .filter(|host| !self.storage.is_rejected(host))
            .flat_map(|host| filter::probe_urls(host, &ports))
            .collect();

        futures::stream::iter(candidates)
            .map(|url| async move { self.probe_reachable(&url).await.then_some(url) })
            .buffered(self.config.peer_concurrency.max(1))
            .filter_map(|reachable| async move { reachable })
            .collect()
            .await
    }

    async fn probe_reachable(&self, url: &str) -> bool {
        let Some((host, port)) = filter::host_port_of(url) else {
            return false;
        };
        let timeout = Duration::from_secs(self.config.timeout_secs);
        matches!(
            tokio::time::timeout(
                timeout,
                tokio::net::TcpStream::connect((host.as_str(), port))
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn find_chain_by_id(&self, chain_id: &str) -> Option<Chain> {
        self.storage
            .chains()
            .await
            .into_iter()
            .find(|c| c.chain_id == chain_id)
    }

    async fn flush(&self, state: &CrawlState) -> Result<()> {
        let mut chain = state.chain.clone();
        self.balancer.apply_stats(&mut chain);
        self.storage.upsert_chain(chain).await?;
        self.storage.save_ip_sets().await?;
        self.storage.save_ports().await?;
        Ok(())
    }
}

/// Union the three advertised address sources.
fn peer_addresses(peer: &Peer) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(node_info) = &peer.node_info {
        if let Some(addr) = &node_info.listen_addr {
            out.push(addr.clone());
        }
        if let Some(addr) = &node_info.other.rpc_address {
            out.push(addr.clone());
        }
    }
    if let Some(ip) = &peer.remote_ip {
        out.push(ip.clone());
    }
    out
}

/// Routable candidate hosts (deduplicated, order preserved) and any
/// explicit ports seen in peer payloads.
fn collect_peer_hosts(peers: &[Peer]) -> (Vec<String>, Vec<u16>) {
    let mut hosts = Vec::new();
    let mut seen = HashSet::new();
    let mut ports = Vec::new();

    for peer in peers {
        for addr in peer_addresses(peer) {
            let Some((host, port)) = filter::parse_host_port(&addr) else {
                continue;
            };
            if let Some(port) = port {
                ports.push(port);
            }
            if !filter::is_routable_host(&host) {
                continue;
            }
            if seen.insert(host.clone()) {
                hosts.push(host);
            }
        }
    }
    (hosts, ports)
}
