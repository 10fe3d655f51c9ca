//! End-to-end tests for the proxy pipeline: caching, retries with
//! failover, error classification, and exhaustion behavior.

mod common;

use axum::http::{HeaderMap, Method};
use chainlb::config::GlobalConfig;
use chainlb::error::ProxyError;
use chainlb::proxy::pipeline::{forward, InboundRequest};
use chainlb::types::Chain;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn get_request(chain: &str, upstream_path: &str) -> InboundRequest {
    InboundRequest {
        chain: chain.to_string(),
        path: upstream_path.to_string(),
        query: None,
        method: Method::GET,
        headers: HeaderMap::new(),
        body: Default::default(),
        client_ip: Some("203.0.113.7".to_string()),
    }
}

async fn seed_chain(app: &common::TestApp, name: &str, urls: &[&str]) {
    let mut chain = Chain::new(name, format!("{name}-1"));
    for url in urls {
        chain.add_endpoint(url);
    }
    app.state.storage.upsert_chain(chain).await.unwrap();
}

#[tokio::test]
async fn unknown_chain_is_a_client_error() {
    let app = common::app().await;
    let err = forward(&app.state, get_request("nope", "status")).await.unwrap_err();
    assert!(matches!(err, ProxyError::UnknownChain(_)));
}

#[tokio::test]
async fn success_passes_through_and_caches() {
    let app = common::app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "result": { "ok": true } }))
                .insert_header("x-upstream", "yes"),
        )
        .expect(1)
        .mount(&server)
        .await;
    seed_chain(&app, "testchain", &[&server.uri()]).await;

    let resp = forward(&app.state, get_request("testchain", "status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "MISS");
    assert_eq!(resp.headers()["x-upstream"], "yes");

    // Second request is served from cache; the mock's expect(1) holds.
    let resp = forward(&app.state, get_request("testchain", "status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-cache"], "HIT");

    let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["result"]["ok"], true);
}

#[tokio::test]
async fn failover_retries_the_next_endpoint() {
    let app = common::app().await;
    let bad = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bad)
        .await;
    let good = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "height": 7 })))
        .mount(&good)
        .await;

    // Round-robin hits the bad endpoint first.
    seed_chain(&app, "testchain", &[&bad.uri(), &good.uri()]).await;

    let resp = forward(&app.state, get_request("testchain", "block?height=7")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let chain = app.state.storage.get_chain("testchain").await.unwrap();
    let snap = app.state.balancer.snapshot(&chain);
    assert_eq!(snap[0].failure_count, 1);
    assert_eq!(snap[1].success_count, 1);
}

#[tokio::test]
async fn exhaustion_returns_categorized_502() {
    let app = common::app().await;
    let s1 = MockServer::start().await;
    let s2 = MockServer::start().await;
    for server in [&s1, &s2] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(server)
            .await;
    }
    seed_chain(&app, "testchain", &[&s1.uri(), &s2.uri()]).await;

    let mut global = GlobalConfig::default();
    global.retries = 2;
    global.backoff_multiplier = 1.0;
    app.state.config.set_global(global).await.unwrap();

    let err = forward(&app.state, get_request("testchain", "status")).await.unwrap_err();
    match err {
        ProxyError::UpstreamExhausted { category, last_host } => {
            assert_eq!(category, "http_500");
            assert!(last_host.contains("127.0.0.1"));
        },
        other => panic!("expected exhaustion, got {other:?}"),
    }

    // Both endpoints were tried once and counted as failures.
    let chain = app.state.storage.get_chain("testchain").await.unwrap();
    let snap = app.state.balancer.snapshot(&chain);
    assert_eq!(snap[0].failure_count, 1);
    assert_eq!(snap[1].failure_count, 1);
}

#[tokio::test]
async fn upstream_4xx_passes_through_as_success() {
    let app = common::app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(serde_json::json!({ "error": "no such tx" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    seed_chain(&app, "testchain", &[&server.uri()]).await;

    let resp = forward(&app.state, get_request("testchain", "tx?hash=0xdead")).await.unwrap();
    assert_eq!(resp.status(), 404);

    // Not retried, and counted as a success for endpoint health.
    let chain = app.state.storage.get_chain("testchain").await.unwrap();
    let snap = app.state.balancer.snapshot(&chain);
    assert_eq!(snap[0].success_count, 1);
    assert_eq!(snap[0].failure_count, 0);
}

#[tokio::test]
async fn invalid_json_on_cacheable_route_is_retried() {
    let app = common::app().await;
    let garbled = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&garbled)
        .await;
    let good = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": 1 })))
        .mount(&good)
        .await;
    seed_chain(&app, "testchain", &[&garbled.uri(), &good.uri()]).await;

    let resp = forward(&app.state, get_request("testchain", "status")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let chain = app.state.storage.get_chain("testchain").await.unwrap();
    let snap = app.state.balancer.snapshot(&chain);
    assert_eq!(snap[0].failure_count, 1);
    assert_eq!(snap[1].success_count, 1);
}

#[tokio::test]
async fn non_cacheable_post_is_forwarded_fresh_each_time() {
    let app = common::app().await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broadcast_tx_sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "code": 0 })))
        .expect(2)
        .mount(&server)
        .await;
    seed_chain(&app, "testchain", &[&server.uri()]).await;

    for _ in 0..2 {
        let mut req = get_request("testchain", "broadcast_tx_sync");
        req.method = Method::POST;
        req.body = axum::body::Bytes::from_static(b"{\"tx\":\"0xabc\"}");
        let resp = forward(&app.state, req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}

#[tokio::test]
async fn repeated_failures_trip_the_breaker() {
    let app = common::app().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    seed_chain(&app, "testchain", &[&server.uri()]).await;

    // Three failed requests reach the breaker threshold.
    for _ in 0..3 {
        let _ = forward(&app.state, get_request("testchain", "status")).await;
    }

    // With the only endpoint's breaker open, selection fails outright.
    let err = forward(&app.state, get_request("testchain", "status")).await.unwrap_err();
    assert!(matches!(err, ProxyError::NoAvailableEndpoint(_)));
}
