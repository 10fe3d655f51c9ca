//! The proxying pipeline.
//!
//! Per inbound request: consult the cache, select an endpoint, forward
//! with the route timeout, classify the outcome, record stats on the
//! breaker and balancer, retry with backoff until the attempt budget or
//! the endpoint set is exhausted. Bodies pass through untouched; JSON
//! validation only decides cacheability and success counting.

use crate::crawler::filter::host_of;
use crate::error::ProxyError;
use crate::proxy::server::AppState;
use axum::body::{Body, Bytes};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, Method, Response, StatusCode};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

const BASE_DELAY_MS: f64 = 100.0;
const CACHE_MARKER: &str = "x-cache";

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "connection",
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
];

pub struct InboundRequest {
    pub chain: String,
    /// Upstream path, leading slash stripped.
    pub path: String,
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
}

pub async fn forward(
    state: &AppState,
    inbound: InboundRequest,
) -> Result<Response<Body>, ProxyError> {
    let chain = match state.storage.get_chain(&inbound.chain).await {
        Some(chain) => chain,
        None => {
            // Degraded with an empty catalog is a service problem, not a
            // client one.
            if state.health.is_degraded() && state.storage.chain_count() == 0 {
                return Err(ProxyError::Degraded);
            }
            return Err(ProxyError::UnknownChain(inbound.chain.clone()));
        },
    };
    let route = state.config.effective_route(&inbound.chain, &inbound.path);

    let path_q = match &inbound.query {
        Some(q) => format!("{}?{}", inbound.path, q),
        None => inbound.path.clone(),
    };

    let cache_key = cache_key_for(&inbound, &route, &path_q);
    if let Some(key) = &cache_key {
        if let Some(bytes) = state.cache.get(key) {
            debug!(%key, "Cache hit");
            return Ok(cached_response(bytes));
        }
    }

    let upstream_headers = strip_hop_by_hop(&inbound.headers);
    let timeout = Duration::from_millis(route.timeout_ms);
    let client_ip = inbound.client_ip.as_deref();

    let mut tried: HashSet<String> = HashSet::new();
    let mut last_host = String::new();
    let mut last_category = String::from("no_endpoint");

    for attempt in 0..route.retries.max(1) {
        if attempt > 0 {
            let delay = BASE_DELAY_MS * route.backoff_multiplier.powi(attempt as i32 - 1);
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let url = match state.balancer.select_from(&chain, &route, client_ip, &tried) {
            Ok(url) => url,
            Err(_) if tried.is_empty() => {
                return Err(ProxyError::NoAvailableEndpoint(inbound.chain.clone()))
            },
            // Every remaining endpoint has been tried.
            Err(_) => break,
        };
        tried.insert(url.clone());
        last_host = host_of(&url).unwrap_or_else(|| url.clone());

        let breaker = state.breakers.get_or_create(&url);
        if !breaker.should_allow() {
            last_category = "circuit_open".to_string();
            continue;
        }

        state.balancer.begin_request(&url);
        let started = Instant::now();
        let result = send_upstream(state, &url, &path_q, &inbound, &upstream_headers, timeout).await;
        let latency_ms = started.elapsed().as_millis() as f64;
        state.balancer.end_request(&url);

        match result {
            Ok((status, headers, body)) => {
                if status.is_success() {
                    // Shape check gates caching and success accounting only.
                    if cache_key.is_some() && serde_json::from_slice::<serde_json::Value>(&body).is_err()
                    {
                        breaker.record(false);
                        state.balancer.record_result(&url, latency_ms, false);
                        last_category = "invalid_json".to_string();
                        warn!(%url, "Upstream returned unparseable JSON");
                        continue;
                    }

                    breaker.record(true);
                    state.balancer.record_result(&url, latency_ms, true);

                    if let Some(key) = &cache_key {
                        state.cache.set(
                            key,
                            body.to_vec(),
                            Some(Duration::from_secs(route.cache_ttl_secs)),
                        );
                    }
                    return Ok(passthrough_response(status, &headers, body, "MISS"));
                }

                if status.is_client_error() {
                    // The endpoint worked; the request was bad. Verbatim,
                    // and a success as far as endpoint health goes.
                    breaker.record(true);
                    state.balancer.record_result(&url, latency_ms, true);
                    return Ok(passthrough_response(status, &headers, body, "SKIP"));
                }

                breaker.record(false);
                state.balancer.record_result(&url, latency_ms, false);
                last_category = format!("http_{}", status.as_u16());
                debug!(%url, %status, attempt, "Upstream error, retrying");
            },
            Err(e) => {
                breaker.record(false);
                state.balancer.record_result(&url, latency_ms, false);
                last_category = if e.is_timeout() {
                    "timeout".to_string()
                } else if e.is_connect() {
                    "connect".to_string()
                } else {
                    "network".to_string()
                };
                debug!(%url, attempt, "Upstream call failed: {e}");
            },
        }
    }

    Err(ProxyError::UpstreamExhausted {
        last_host,
        category: last_category,
    })
}

/// `chain:METHOD:path[:bodyHash]` when the route caches this request.
fn cache_key_for(
    inbound: &InboundRequest,
    route: &crate::config::EffectiveRouteConfig,
    path_q: &str,
) -> Option<String> {
    if !route.cache_enabled {
        return None;
    }
    let idempotent = match inbound.method {
        Method::GET | Method::HEAD => true,
        Method::POST => route
            .cacheable_post_prefixes
            .iter()
            .any(|prefix| inbound.path.starts_with(prefix.as_str())),
        _ => false,
    };
    if !idempotent {
        return None;
    }

    let mut key = format!("{}:{}:{}", inbound.chain, inbound.method, path_q);
    if inbound.method == Method::POST {
        key.push_str(&format!(":{:016x}", xxh3_64(&inbound.body)));
    }
    Some(key)
}

async fn send_upstream(
    state: &AppState,
    url: &str,
    path_q: &str,
    inbound: &InboundRequest,
    headers: &HeaderMap,
    timeout: Duration,
) -> Result<(StatusCode, HeaderMap, Bytes), reqwest::Error> {
    let target = if path_q.is_empty() {
        url.to_string()
    } else {
        format!("{url}/{path_q}")
    };

    let mut request = state
        .upstream
        .request(inbound.method.clone(), &target)
        .headers(headers.clone())
        .timeout(timeout);
    if inbound.method != Method::GET && inbound.method != Method::HEAD {
        request = request.body(inbound.body.clone());
    }

    let response = request.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok((status, headers, body))
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

fn cached_response(bytes: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header(CACHE_MARKER, "HIT")
        .body(Body::from(bytes))
        .expect("static response parts")
}

fn passthrough_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
    cache_marker: &str,
) -> Response<Body> {
    let mut response = Response::builder().status(status);
    if let Some(map) = response.headers_mut() {
        for (name, value) in headers {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            map.insert(name.clone(), value.clone());
        }
        map.insert(
            HeaderName::from_static(CACHE_MARKER),
            HeaderValue::from_str(cache_marker).unwrap_or(HeaderValue::from_static("MISS")),
        );
    }
    response
        .body(Body::from(body))
        .expect("static response parts")
}
