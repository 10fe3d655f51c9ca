//! Request handlers: the `/lb` proxy surface plus the admin, stats,
//! config, and cache-management APIs.

use crate::config::{ChainConfig, GlobalConfig};
use crate::error::ProxyError;
use crate::proxy::pipeline::{self, InboundRequest};
use crate::proxy::server::AppState;
use crate::types::{AddChainRequest, Chain, ChainSummary};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::info;

/// Inbound bodies above this size are rejected rather than buffered.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Proxy surface

pub async fn proxy_chain_root(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<Response, ProxyError> {
    proxy(state, chain, String::new(), addr, req).await
}

pub async fn proxy_chain_path(
    State(state): State<AppState>,
    Path((chain, path)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Result<Response, ProxyError> {
    proxy(state, chain, path, addr, req).await
}

async fn proxy(
    state: AppState,
    chain: String,
    path: String,
    addr: SocketAddr,
    req: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("body: {e}")))?;

    let client_ip = client_ip(&parts.headers, addr);
    let inbound = InboundRequest {
        chain,
        path: path.trim_start_matches('/').to_string(),
        query: parts.uri.query().map(str::to_string),
        method: parts.method,
        headers: parts.headers,
        body,
        client_ip: Some(client_ip),
    };
    pipeline::forward(&state, inbound).await
}

/// Prefer the first `X-Forwarded-For` hop, fall back to the socket peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

// ---------------------------------------------------------------------------
// Health and stats

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let degraded = state.health.is_degraded();
    let memory = sys_info::mem_info().ok().map(|m| {
        json!({
            "total_kb": m.total,
            "avail_kb": m.avail,
            "free_kb": m.free,
        })
    });

    let body = json!({
        "status": if degraded { "DEGRADED" } else { "UP" },
        "initialFetchComplete": state.health.initial_fetch_complete(),
        "chains": state.storage.chain_count(),
        "cacheStats": state.cache.stats(),
        "schedulerTasks": state.scheduler.status(),
        "memory": memory,
    });

    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body))
}

pub async fn stats_all(State(state): State<AppState>) -> Result<Response, ProxyError> {
    const KEY: &str = "metrics:stats";
    if let Some(bytes) = state.cache.get(KEY) {
        return Ok(json_bytes_response(bytes));
    }

    let mut map = serde_json::Map::new();
    for chain in state.storage.chains().await {
        map.insert(
            chain.chain_name.clone(),
            serde_json::to_value(state.balancer.snapshot(&chain))?,
        );
    }
    let value = Value::Object(map);
    state.cache.set(KEY, serde_json::to_vec(&value)?, None);
    Ok(Json(value).into_response())
}

pub async fn stats_chain(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Response, ProxyError> {
    let key = format!("metrics:stats:{chain}");
    if let Some(bytes) = state.cache.get(&key) {
        return Ok(json_bytes_response(bytes));
    }

    let chain = state
        .storage
        .get_chain(&chain)
        .await
        .ok_or(ProxyError::UnknownChain(chain))?;
    let value = serde_json::to_value(state.balancer.snapshot(&chain))?;
    state.cache.set(&key, serde_json::to_vec(&value)?, None);
    Ok(Json(value).into_response())
}

// ---------------------------------------------------------------------------
// Catalog API

pub async fn chain_list(State(state): State<AppState>) -> Result<Response, ProxyError> {
    const KEY: &str = "chain:list";
    if let Some(bytes) = state.cache.get(KEY) {
        return Ok(json_bytes_response(bytes));
    }

    let names: Vec<String> = state
        .storage
        .chains()
        .await
        .into_iter()
        .map(|c| c.chain_name)
        .collect();
    let value = serde_json::to_value(&names)?;
    state.cache.set(KEY, serde_json::to_vec(&value)?, None);
    Ok(Json(value).into_response())
}

pub async fn chains_summary(State(state): State<AppState>) -> Result<Response, ProxyError> {
    const KEY: &str = "chain:summary";
    if let Some(bytes) = state.cache.get(KEY) {
        return Ok(json_bytes_response(bytes));
    }

    let summaries: Vec<ChainSummary> = state
        .storage
        .chains()
        .await
        .iter()
        .map(ChainSummary::from)
        .collect();
    let value = serde_json::to_value(&summaries)?;
    state.cache.set(KEY, serde_json::to_vec(&value)?, None);
    Ok(Json(value).into_response())
}

pub async fn rpc_list(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Response, ProxyError> {
    let key = format!("rpc:list:{chain}");
    if let Some(bytes) = state.cache.get(&key) {
        return Ok(json_bytes_response(bytes));
    }

    let chain = state
        .storage
        .get_chain(&chain)
        .await
        .ok_or(ProxyError::UnknownChain(chain))?;
    let urls: Vec<&str> = chain.endpoints.iter().map(|e| e.url.as_str()).collect();
    let value = serde_json::to_value(&urls)?;
    state.cache.set(&key, serde_json::to_vec(&value)?, None);
    Ok(Json(value).into_response())
}

pub async fn update_chain(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let updated = state
        .registry
        .refresh_chain(&state.storage, &chain)
        .await
        .map_err(ProxyError::from)?;
    invalidate_listings(&state, &updated.chain_name);
    Ok(Json(json!({
        "chain": updated.chain_name,
        "endpoints": updated.endpoints.len(),
    })))
}

pub async fn update_all_chains(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    match state.registry.refresh_all(&state.storage).await {
        Ok(updated) => {
            state.health.set_degraded(false);
            state.health.mark_initial_fetch_complete();
            state.cache.flush(Some(&Regex::new("^(chain:|rpc:list)").expect("static regex")));
            Ok(Json(json!({ "updated": updated })))
        },
        Err(e) => {
            state.health.set_degraded(true);
            Err(ProxyError::Internal(e.to_string()))
        },
    }
}

pub async fn cleanup_blacklist(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    let removed = state
        .storage
        .cleanup_blacklist()
        .await
        .map_err(ProxyError::from)?;
    Ok(Json(json!({ "removed": removed })))
}

pub async fn add_chain(
    State(state): State<AppState>,
    Json(req): Json<AddChainRequest>,
) -> Result<(StatusCode, Json<Value>), ProxyError> {
    if req.chain_name.is_empty() || req.chain_id.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "chainName and chainId are required".to_string(),
        ));
    }
    if state.storage.get_chain(&req.chain_name).await.is_some() {
        return Err(ProxyError::ChainExists(req.chain_name));
    }

    let mut chain = Chain::new(req.chain_name.clone(), req.chain_id);
    chain.bech32_prefix = req.bech32_prefix;
    for address in &req.rpc_addresses {
        if let Some(url) = crate::crawler::filter::normalize_url(address) {
            chain.add_endpoint(&url);
        }
    }
    if chain.endpoints.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "no valid rpcAddresses".to_string(),
        ));
    }

    state.balancer.apply_stats(&mut chain);
    state
        .storage
        .upsert_chain(chain.clone())
        .await
        .map_err(ProxyError::from)?;
    invalidate_listings(&state, &chain.chain_name);
    info!(chain = %chain.chain_name, "Chain added via API");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(ChainSummary::from(&chain))?),
    ))
}

pub async fn remove_chain(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let removed = state
        .storage
        .remove_chain(&chain)
        .await
        .map_err(ProxyError::from)?;
    if !removed {
        return Err(ProxyError::UnknownChain(chain));
    }

    // Drop everything cached under this chain's prefix.
    if let Ok(re) = Regex::new(&format!("^{}:", regex::escape(&chain))) {
        state.cache.flush(Some(&re));
    }
    invalidate_listings(&state, &chain);
    info!(chain = %chain, "Chain removed via API");
    Ok(Json(json!({ "removed": chain })))
}

fn invalidate_listings(state: &AppState, chain: &str) {
    state.cache.delete("chain:list");
    state.cache.delete("chain:summary");
    state.cache.delete(&format!("rpc:list:{chain}"));
}

// ---------------------------------------------------------------------------
// Config API

pub async fn get_global_config(State(state): State<AppState>) -> Json<GlobalConfig> {
    Json((*state.config.global()).clone())
}

pub async fn put_global_config(
    State(state): State<AppState>,
    Json(cfg): Json<GlobalConfig>,
) -> Result<Json<Value>, ProxyError> {
    state
        .config
        .set_global(cfg)
        .await
        .map_err(ProxyError::from)?;
    Ok(Json(json!({ "updated": "global" })))
}

pub async fn get_chain_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ChainConfig>, ProxyError> {
    state
        .config
        .chain(&name)
        .map(Json)
        .ok_or(ProxyError::UnknownChain(name))
}

pub async fn put_chain_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(cfg): Json<ChainConfig>,
) -> Result<Json<Value>, ProxyError> {
    state
        .config
        .set_chain(&name, cfg)
        .await
        .map_err(ProxyError::from)?;
    Ok(Json(json!({ "updated": name })))
}

// ---------------------------------------------------------------------------
// Cache API

pub async fn flush_cache_chain(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let re = Regex::new(&format!("^{}:", regex::escape(&chain)))
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    Ok(Json(json!({ "flushed": state.cache.flush(Some(&re)) })))
}

pub async fn flush_cache_path(
    State(state): State<AppState>,
    Path((chain, path)): Path<(String, String)>,
) -> Result<Json<Value>, ProxyError> {
    let path = path.trim_start_matches('/');
    let re = Regex::new(&format!(
        "{}:.*{}",
        regex::escape(&chain),
        regex::escape(path)
    ))
    .map_err(|e| ProxyError::Internal(e.to_string()))?;
    Ok(Json(json!({ "flushed": state.cache.flush(Some(&re)) })))
}

fn json_bytes_response(bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("x-cache", "HIT")
        .body(Body::from(bytes))
        .expect("static response parts")
}
