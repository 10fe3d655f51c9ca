//! chainlb - a load-balancing reverse proxy for blockchain JSON-RPC
//! fleets. Fronts many chains at once, caches by method semantics,
//! tracks per-endpoint health, and discovers new endpoints by crawling
//! peer gossip.

use chainlb::cache::TieredCache;
use chainlb::config::ConfigService;
use chainlb::crawler::Crawler;
use chainlb::health::circuit_breaker::CircuitBreakerManager;
use chainlb::health::SystemHealth;
use chainlb::proxy::server::{AppState, ProxyServer};
use chainlb::registry::RegistryClient;
use chainlb::routing::BalancerService;
use chainlb::scheduler::Scheduler;
use chainlb::storage::{FileStorage, Storage};
use chainlb::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chainlb")]
#[command(about = "Load-balancing reverse proxy for blockchain JSON-RPC fleets", long_about = None)]
#[command(version)]
struct Cli {
    /// Listen port (falls back to the global config value)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Directory for the persistent catalog
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for configuration files
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// GitHub token for chain-registry API calls
    #[arg(long, env = "GITHUB_PAT", hide_env_values = true)]
    github_pat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Startup failures here (unwritable dirs, bad port) are fatal.
    let config = ConfigService::load(&cli.config_dir).await?;
    config.watch()?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&cli.data_dir).await?);

    let cache = Arc::new(TieredCache::new(Duration::from_secs(
        config.global().cache_ttl_secs,
    )));
    let _sweeper = cache.spawn_sweeper();

    let breakers = Arc::new(CircuitBreakerManager::default());
    let balancer = Arc::new(BalancerService::new(
        storage.clone(),
        breakers.clone(),
        cache.clone(),
        config.clone(),
    ));
    let crawler = Arc::new(Crawler::new(
        storage.clone(),
        breakers.clone(),
        balancer.clone(),
        config.global().crawler.clone(),
    )?);
    let registry = Arc::new(
        RegistryClient::new(cli.github_pat.clone())?
            .with_cache(cache.clone())
            .with_balancer(balancer.clone()),
    );
    let scheduler = Arc::new(Scheduler::new());
    let health = Arc::new(SystemHealth::new());

    let state = AppState {
        config,
        storage,
        cache,
        breakers,
        balancer,
        scheduler: scheduler.clone(),
        health,
        crawler,
        registry,
        upstream: AppState::upstream_client()?,
    };

    register_default_tasks(&state)?;
    scheduler.start();
    spawn_initial_fetch(&state);

    let port = cli.port.unwrap_or_else(|| state.config.global().port);
    let server = ProxyServer::new(state, port);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        let _ = shutdown.send(());
    });

    server.run().await
}

/// Seed the catalog in the background. A failed fetch leaves the stale
/// catalog serving and flips the health flag; the recovery task retries.
fn spawn_initial_fetch(state: &AppState) {
    let state = state.clone();
    tokio::spawn(async move {
        match state.registry.refresh_all(&state.storage).await {
            Ok(chains) => {
                state.health.mark_initial_fetch_complete();
                info!(chains, "Initial registry fetch complete");
            },
            Err(e) => {
                state.health.set_degraded(true);
                warn!("Initial registry fetch failed, serving stale catalog: {e}");
            },
        }
    });
}

fn register_default_tasks(state: &AppState) -> Result<()> {
    {
        let state = state.clone();
        state.scheduler.clone().register(
            "registry-refresh",
            "0 */12 * * *",
            Arc::new(move || {
                let state = state.clone();
                Box::pin(async move {
                    match state.registry.refresh_all(&state.storage).await {
                        Ok(chains) => {
                            state.health.set_degraded(false);
                            state.health.mark_initial_fetch_complete();
                            info!(chains, "Registry refresh complete");
                            Ok(())
                        },
                        Err(e) => {
                            state.health.set_degraded(true);
                            Err(e)
                        },
                    }
                })
            }),
        )?;
    }

    {
        let state = state.clone();
        state.scheduler.clone().register(
            "blacklist-cleanup",
            "0 * * * *",
            Arc::new(move || {
                let state = state.clone();
                Box::pin(async move { state.storage.cleanup_blacklist().await.map(|_| ()) })
            }),
        )?;
    }

    {
        let state = state.clone();
        state.scheduler.clone().register(
            "network-crawl",
            "0 0 * * *",
            Arc::new(move || {
                let state = state.clone();
                Box::pin(async move {
                    let summaries = state.crawler.crawl_all().await;
                    let new: usize = summaries.iter().map(|s| s.new_endpoints).sum();
                    info!(chains = summaries.len(), new, "Network crawl complete");
                    Ok(())
                })
            }),
        )?;
    }

    {
        let state = state.clone();
        state.scheduler.clone().register(
            "health-recovery",
            "*/5 * * * *",
            Arc::new(move || {
                let state = state.clone();
                Box::pin(async move {
                    if state.health.is_degraded()
                        && state.registry.refresh_all(&state.storage).await.is_ok()
                    {
                        state.health.set_degraded(false);
                        state.health.mark_initial_fetch_complete();
                        info!("Recovered from degraded state");
                    }
                    Ok(())
                })
            }),
        )?;
    }

    Ok(())
}
