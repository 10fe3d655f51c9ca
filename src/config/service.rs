//! Configuration loading, persistence, and hot reload.
//!
//! The global config lives behind an `ArcSwap` so readers never block;
//! per-chain configs live in a `DashMap`. Updates arrive two ways: admin
//! `PUT`s (persist, then swap) and out-of-band file edits picked up by a
//! debounced `notify` watcher. A file that fails to parse is logged and
//! the previous config stays in place.

use super::{ChainConfig, EffectiveRouteConfig, GlobalConfig, RouteConfig};
use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ConfigService {
    config_dir: PathBuf,
    global: ArcSwap<GlobalConfig>,
    chains: DashMap<String, ChainConfig>,
    // Kept alive for the lifetime of the service; dropping it stops the watch.
    watcher: parking_lot::Mutex<Option<RecommendedWatcher>>,
}

impl ConfigService {
    /// Load `config/global.json` and `config/chains/*.json`, creating the
    /// directories (and a default global file) when absent.
    pub async fn load(config_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let config_dir = config_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(config_dir.join("chains")).await?;

        let global_path = config_dir.join("global.json");
        let global = if global_path.exists() {
            let bytes = tokio::fs::read(&global_path).await?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Config(format!("{}: {}", global_path.display(), e)))?
        } else {
            let cfg = GlobalConfig::default();
            tokio::fs::write(&global_path, serde_json::to_vec_pretty(&cfg)?).await?;
            cfg
        };

        let service = Arc::new(Self {
            config_dir,
            global: ArcSwap::from_pointee(global),
            chains: DashMap::new(),
            watcher: parking_lot::Mutex::new(None),
        });
        service.load_chain_configs().await?;

        info!(
            chains = service.chains.len(),
            "Configuration loaded from {}",
            service.config_dir.display()
        );
        Ok(service)
    }

    async fn load_chain_configs(&self) -> Result<()> {
        let dir = self.config_dir.join("chains");
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<ChainConfig>(&bytes) {
                    Ok(cfg) => {
                        self.chains.insert(name.to_string(), cfg);
                    },
                    Err(e) => warn!("Skipping unparseable chain config {}: {}", path.display(), e),
                },
                Err(e) => warn!("Cannot read chain config {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    pub fn global(&self) -> Arc<GlobalConfig> {
        self.global.load_full()
    }

    pub fn chain(&self, name: &str) -> Option<ChainConfig> {
        self.chains.get(name).map(|c| c.clone())
    }

    /// Persist and swap the global config.
    pub async fn set_global(&self, cfg: GlobalConfig) -> Result<()> {
        let path = self.config_dir.join("global.json");
        write_pretty(&path, &cfg).await?;
        self.global.store(Arc::new(cfg));
        info!("Global configuration updated");
        Ok(())
    }

    /// Persist and swap one chain's config.
    pub async fn set_chain(&self, name: &str, cfg: ChainConfig) -> Result<()> {
        let path = self.config_dir.join("chains").join(format!("{name}.json"));
        write_pretty(&path, &cfg).await?;
        self.chains.insert(name.to_string(), cfg);
        info!(chain = name, "Chain configuration updated");
        Ok(())
    }

    /// Compose global, chain, and first-matching-route layers into the
    /// effective config for `(chain, path)`.
    pub fn effective_route(&self, chain: &str, path: &str) -> EffectiveRouteConfig {
        let global = self.global();
        let chain_cfg = self.chain(chain).unwrap_or_default();

        // Chain routes take precedence over global routes.
        let route = chain_cfg
            .routes
            .iter()
            .chain(global.routes.iter())
            .find(|r| super::glob_match(&r.path, path))
            .cloned();

        compose(&global, &chain_cfg, route)
    }

    /// Start watching the config directory. Out-of-band edits to
    /// `global.json` or `chains/*.json` reload that file; parse errors
    /// leave the running config untouched.
    pub fn watch(self: &Arc<Self>) -> Result<()> {
        let service = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => event,
                Ok(_) => return,
                Err(e) => {
                    error!("Config watcher error: {:?}", e);
                    return;
                },
            };
            let Some(service) = service.upgrade() else { return };
            for path in event.paths {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let service = service.clone();
                handle.spawn(async move {
                    tokio::time::sleep(WATCH_DEBOUNCE).await;
                    service.reload_path(&path).await;
                });
            }
        })
        .map_err(|e| Error::Config(format!("watcher: {e}")))?;

        watcher
            .watch(&self.config_dir, RecursiveMode::Recursive)
            .map_err(|e| Error::Config(format!("watch {}: {e}", self.config_dir.display())))?;
        *self.watcher.lock() = Some(watcher);

        debug!("Watching {} for config changes", self.config_dir.display());
        Ok(())
    }

    async fn reload_path(&self, path: &Path) {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            // Deleted or mid-rename; the next event will catch up.
            Err(_) => return,
        };

        // Watcher events carry absolute paths while the configured dir
        // may be relative; match on names instead of full paths.
        if path.file_name().and_then(|n| n.to_str()) == Some("global.json") {
            match serde_json::from_slice::<GlobalConfig>(&bytes) {
                Ok(cfg) => {
                    self.global.store(Arc::new(cfg));
                    info!("Global configuration reloaded from disk");
                },
                Err(e) => error!("Ignoring invalid global config edit: {}", e),
            }
            return;
        }

        let in_chains_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == "chains")
            .unwrap_or(false);
        if in_chains_dir {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                return;
            };
            match serde_json::from_slice::<ChainConfig>(&bytes) {
                Ok(cfg) => {
                    self.chains.insert(name.to_string(), cfg);
                    info!(chain = name, "Chain configuration reloaded from disk");
                },
                Err(e) => error!(chain = name, "Ignoring invalid chain config edit: {}", e),
            }
        }
    }
}

fn compose(
    global: &GlobalConfig,
    chain: &ChainConfig,
    route: Option<RouteConfig>,
) -> EffectiveRouteConfig {
    let route = route.unwrap_or(RouteConfig {
        path: "*".to_string(),
        strategy: None,
        timeout_ms: None,
        retries: None,
        backoff_multiplier: None,
        cache_enabled: None,
        cache_ttl_secs: None,
        sticky_sessions: None,
        endpoint_whitelist: Vec::new(),
        endpoint_blacklist: Vec::new(),
        cacheable_post_prefixes: None,
    });

    EffectiveRouteConfig {
        route_pattern: route.path.clone(),
        strategy: route.strategy.or(chain.strategy).unwrap_or(global.strategy),
        timeout_ms: route
            .timeout_ms
            .or(chain.timeout_ms)
            .unwrap_or(global.timeout_ms),
        retries: route.retries.or(chain.retries).unwrap_or(global.retries),
        backoff_multiplier: route
            .backoff_multiplier
            .or(chain.backoff_multiplier)
            .unwrap_or(global.backoff_multiplier),
        cache_enabled: route
            .cache_enabled
            .or(chain.cache_enabled)
            .unwrap_or(global.cache_enabled),
        cache_ttl_secs: route
            .cache_ttl_secs
            .or(chain.cache_ttl_secs)
            .unwrap_or(global.cache_ttl_secs),
        sticky_sessions: route
            .sticky_sessions
            .or(chain.sticky_sessions)
            .unwrap_or(global.sticky_sessions),
        endpoint_whitelist: route.endpoint_whitelist,
        endpoint_blacklist: route.endpoint_blacklist,
        cacheable_post_prefixes: route
            .cacheable_post_prefixes
            .unwrap_or_else(|| global.cacheable_post_prefixes.clone()),
    }
}

async fn write_pretty<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::load_balancer::Strategy;

    #[tokio::test]
    async fn load_creates_default_global() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConfigService::load(dir.path()).await.unwrap();
        assert_eq!(service.global().retries, 3);
        assert!(dir.path().join("global.json").exists());
    }

    #[tokio::test]
    async fn effective_route_layering() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConfigService::load(dir.path()).await.unwrap();

        let mut global = GlobalConfig::default();
        global.retries = 5;
        global.routes = vec![RouteConfig {
            path: "status*".to_string(),
            strategy: None,
            timeout_ms: Some(1_000),
            retries: None,
            backoff_multiplier: None,
            cache_enabled: None,
            cache_ttl_secs: None,
            sticky_sessions: None,
            endpoint_whitelist: Vec::new(),
            endpoint_blacklist: Vec::new(),
            cacheable_post_prefixes: None,
        }];
        service.set_global(global).await.unwrap();

        let mut chain = ChainConfig::default();
        chain.strategy = Some(Strategy::Weighted);
        service.set_chain("osmosis", chain).await.unwrap();

        let eff = service.effective_route("osmosis", "status");
        assert_eq!(eff.route_pattern, "status*");
        assert_eq!(eff.timeout_ms, 1_000);
        assert_eq!(eff.retries, 5);
        assert_eq!(eff.strategy, Strategy::Weighted);

        // Unmatched path falls back to the wildcard route.
        let eff = service.effective_route("osmosis", "tx_search");
        assert_eq!(eff.route_pattern, "*");
        assert_eq!(eff.strategy, Strategy::Weighted);

        // Unknown chain composes global only.
        let eff = service.effective_route("nonexistent", "status");
        assert_eq!(eff.strategy, Strategy::RoundRobin);
    }

    #[tokio::test]
    async fn set_chain_persists() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConfigService::load(dir.path()).await.unwrap();
        service
            .set_chain("juno", ChainConfig { retries: Some(9), ..Default::default() })
            .await
            .unwrap();

        let reloaded = ConfigService::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.chain("juno").unwrap().retries, Some(9));
    }
}
