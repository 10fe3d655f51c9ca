//! Shared fixtures for integration tests.

use chainlb::cache::TieredCache;
use chainlb::config::{ConfigService, CrawlerConfig};
use chainlb::crawler::Crawler;
use chainlb::health::circuit_breaker::CircuitBreakerManager;
use chainlb::health::SystemHealth;
use chainlb::proxy::server::AppState;
use chainlb::registry::RegistryClient;
use chainlb::routing::BalancerService;
use chainlb::scheduler::Scheduler;
use chainlb::storage::{FileStorage, Storage};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestApp {
    pub state: AppState,
    _data_dir: TempDir,
    _config_dir: TempDir,
}

/// A fully wired application over temp directories, with crawler
/// timeouts tightened for test speed.
pub async fn app() -> TestApp {
    let data_dir = tempfile::tempdir().unwrap();
    let config_dir = tempfile::tempdir().unwrap();

    let config = ConfigService::load(config_dir.path()).await.unwrap();
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::open(data_dir.path()).await.unwrap());
    let cache = Arc::new(TieredCache::new(Duration::from_secs(60)));
    let breakers = Arc::new(CircuitBreakerManager::default());
    let balancer = Arc::new(BalancerService::new(
        storage.clone(),
        breakers.clone(),
        cache.clone(),
        config.clone(),
    ));

    let crawler_config = CrawlerConfig {
        timeout_secs: 2,
        retries: 0,
        retry_delay_ms: 10,
        ..Default::default()
    };
    let crawler = Arc::new(
        Crawler::new(
            storage.clone(),
            breakers.clone(),
            balancer.clone(),
            crawler_config,
        )
        .unwrap(),
    );

    // Points nowhere; tests that need the registry mount their own double.
    let registry = Arc::new(
        RegistryClient::with_bases("http://127.0.0.1:9", "http://127.0.0.1:9/contents", None)
            .unwrap()
            .with_balancer(balancer.clone()),
    );

    let state = AppState {
        config,
        storage,
        cache,
        breakers,
        balancer,
        scheduler: Arc::new(Scheduler::new()),
        health: Arc::new(SystemHealth::new()),
        crawler,
        registry,
        upstream: AppState::upstream_client().unwrap(),
    };

    TestApp {
        state,
        _data_dir: data_dir,
        _config_dir: config_dir,
    }
}
