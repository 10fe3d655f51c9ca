//! HTTP server assembly.
//!
//! Builds the axum router over the shared application state and runs it
//! with graceful shutdown. Every component is constructed once at
//! startup and injected; handlers only ever see `AppState`.

use axum::routing::{any, delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::cache::TieredCache;
use crate::config::ConfigService;
use crate::crawler::Crawler;
use crate::error::{Error, Result};
use crate::health::circuit_breaker::CircuitBreakerManager;
use crate::health::SystemHealth;
use crate::proxy::handler;
use crate::registry::RegistryClient;
use crate::routing::BalancerService;
use crate::scheduler::Scheduler;
use crate::storage::Storage;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigService>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<TieredCache>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub balancer: Arc<BalancerService>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<SystemHealth>,
    pub crawler: Arc<Crawler>,
    pub registry: Arc<RegistryClient>,
    /// Upstream client: permissive TLS, per-request timeouts from route
    /// config.
    pub upstream: reqwest::Client,
}

impl AppState {
    /// Build the upstream HTTP client. Chain operators frequently serve
    /// self-signed certs, so verification is permissive.
    pub fn upstream_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?)
    }
}

pub struct ProxyServer {
    state: AppState,
    port: u16,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl ProxyServer {
    pub fn new(state: AppState, port: u16) -> Self {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self {
            state,
            port,
            shutdown_tx,
        }
    }

    fn build_router(&self) -> Router {
        let proxy_routes = Router::new()
            .route("/lb/:chain", any(handler::proxy_chain_root))
            .route("/lb/:chain/", any(handler::proxy_chain_root))
            .route("/lb/:chain/*path", any(handler::proxy_chain_path));

        let api_routes = Router::new()
            .route("/chain-list", get(handler::chain_list))
            .route("/chains-summary", get(handler::chains_summary))
            .route("/rpc-list/:chain", get(handler::rpc_list))
            .route("/update-chain/:chain", post(handler::update_chain))
            .route("/update-all-chains", post(handler::update_all_chains))
            .route("/cleanup-blacklist", post(handler::cleanup_blacklist))
            .route("/add-chain", post(handler::add_chain))
            .route("/remove-chain/:chain", delete(handler::remove_chain));

        Router::new()
            .merge(proxy_routes)
            .route("/health", get(handler::health))
            .route("/stats", get(handler::stats_all))
            .route("/stats/:chain", get(handler::stats_chain))
            .nest("/api", api_routes)
            .route(
                "/config/global",
                get(handler::get_global_config).put(handler::put_global_config),
            )
            .route(
                "/config/chain/:name",
                get(handler::get_chain_config).put(handler::put_chain_config),
            )
            .route("/cache/:chain", delete(handler::flush_cache_chain))
            .route("/cache/:chain/*path", delete(handler::flush_cache_path))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive())
                    .layer(CompressionLayer::new()),
            )
            .with_state(self.state.clone())
    }

    /// Bind and serve until shutdown. A failed bind is fatal.
    pub async fn run(self) -> Result<()> {
        let router = self.build_router();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("failed to bind {addr}: {e}")))?;
        info!("Listening on {addr}");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Draining connections");
        })
        .await
        .map_err(|e| Error::Server(format!("server error: {e}")))?;

        // Scheduled tasks are not cancelled mid-run; give them a grace
        // period, then detach.
        self.state.scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!("Server stopped");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> tokio::sync::broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
