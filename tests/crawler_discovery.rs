//! Crawler integration tests: identity validation, misplaced-endpoint
//! reassignment, freshness gating, and catalog dedup.

mod common;

use chainlb::types::Chain;
use chrono::{Duration, Utc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_status(server: &MockServer, network: &str, block_age_secs: i64) {
    let latest = Utc::now() - Duration::seconds(block_age_secs);
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": {
                "node_info": { "network": network },
                "sync_info": { "latest_block_time": latest.to_rfc3339() },
            }
        })))
        .mount(server)
        .await;
}

async fn mount_empty_net_info(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/net_info"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "peers": [] }
            })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn healthy_endpoint_keeps_its_chain_current() {
    let app = common::app().await;
    let server = MockServer::start().await;
    mount_status(&server, "chain-a-1", 2).await;
    mount_empty_net_info(&server).await;

    let mut chain = Chain::new("chain-a", "chain-a-1");
    chain.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain).await.unwrap();

    let summary = app.state.crawler.crawl_chain("chain-a").await.unwrap();
    assert_eq!(summary.new_endpoints, 0);
    assert_eq!(summary.total_endpoints, 1);
    assert_eq!(summary.misplaced_endpoints, 0);

    let chain = app.state.storage.get_chain("chain-a").await.unwrap();
    assert!(chain.last_crawled.is_some());
}

#[tokio::test]
async fn misplaced_endpoint_moves_to_its_owner() {
    let app = common::app().await;
    let server = MockServer::start().await;
    // The endpoint listed under chain-a actually serves chain-b.
    mount_status(&server, "chain-b-1", 2).await;
    mount_empty_net_info(&server).await;

    let mut chain_a = Chain::new("chain-a", "chain-a-1");
    chain_a.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain_a).await.unwrap();
    app.state
        .storage
        .upsert_chain(Chain::new("chain-b", "chain-b-1"))
        .await
        .unwrap();

    let summary = app.state.crawler.crawl_chain("chain-a").await.unwrap();
    assert_eq!(summary.misplaced_endpoints, 1);
    assert_eq!(summary.new_endpoints, 0);

    // chain-b gained the endpoint; chain-a is untouched.
    let chain_b = app.state.storage.get_chain("chain-b").await.unwrap();
    assert_eq!(chain_b.endpoints.len(), 1);
    let chain_a = app.state.storage.get_chain("chain-a").await.unwrap();
    assert_eq!(chain_a.endpoints.len(), 1);
}

#[tokio::test]
async fn misplaced_endpoint_for_unknown_chain_is_dropped() {
    let app = common::app().await;
    let server = MockServer::start().await;
    mount_status(&server, "mystery-9", 2).await;
    mount_empty_net_info(&server).await;

    let mut chain = Chain::new("chain-a", "chain-a-1");
    chain.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain).await.unwrap();

    let summary = app.state.crawler.crawl_chain("chain-a").await.unwrap();
    assert_eq!(summary.misplaced_endpoints, 0);
    assert_eq!(summary.new_endpoints, 0);
}

#[tokio::test]
async fn stale_endpoint_fails_the_freshness_gate() {
    let app = common::app().await;
    let server = MockServer::start().await;
    // Ten minutes behind: well past the 60s gate.
    mount_status(&server, "chain-a-1", 600).await;
    mount_empty_net_info(&server).await;

    let mut chain = Chain::new("chain-a", "chain-a-1");
    chain.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain).await.unwrap();

    let summary = app.state.crawler.crawl_chain("chain-a").await.unwrap();
    assert_eq!(summary.new_endpoints, 0);
    assert_eq!(summary.misplaced_endpoints, 0);
}

#[tokio::test]
async fn malformed_status_body_is_invalid() {
    let app = common::app().await;
    let server = MockServer::start().await;
    // Missing sync_info entirely: must fail the typed parse.
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": { "node_info": { "network": "chain-a-1" } }
        })))
        .mount(&server)
        .await;

    let mut chain = Chain::new("chain-a", "chain-a-1");
    chain.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain).await.unwrap();

    let summary = app.state.crawler.crawl_chain("chain-a").await.unwrap();
    assert_eq!(summary.new_endpoints, 0);
}

#[tokio::test]
async fn crawling_twice_never_duplicates_endpoints() {
    let app = common::app().await;
    let server = MockServer::start().await;
    mount_status(&server, "chain-a-1", 2).await;
    mount_empty_net_info(&server).await;

    let mut chain = Chain::new("chain-a", "chain-a-1");
    chain.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain).await.unwrap();

    app.state.crawler.crawl_chain("chain-a").await.unwrap();
    app.state.crawler.crawl_chain("chain-a").await.unwrap();

    let chain = app.state.storage.get_chain("chain-a").await.unwrap();
    let mut urls: Vec<&str> = chain.endpoints.iter().map(|e| e.url.as_str()).collect();
    let before = urls.len();
    urls.dedup();
    assert_eq!(urls.len(), before);
    assert_eq!(before, 1);
}

#[tokio::test]
async fn crawl_flush_persists_live_endpoint_stats() {
    let app = common::app().await;
    let server = MockServer::start().await;
    mount_status(&server, "chain-a-1", 2).await;
    mount_empty_net_info(&server).await;

    let mut chain = Chain::new("chain-a", "chain-a-1");
    chain.add_endpoint(&server.uri());
    app.state.storage.upsert_chain(chain).await.unwrap();

    // Traffic observed by the balancer before the crawl's flush.
    app.state.balancer.record_result(&server.uri(), 42.0, true);
    app.state.balancer.record_result(&server.uri(), 58.0, false);

    app.state.crawler.crawl_chain("chain-a").await.unwrap();

    // The persisted record carries the live counters, not the defaults.
    let reloaded = app.state.storage.get_chain("chain-a").await.unwrap();
    let endpoint = &reloaded.endpoints[0];
    assert_eq!(endpoint.success_count, 1);
    assert_eq!(endpoint.failure_count, 1);
    assert!(endpoint.response_time_ms > 0.0);
    assert!(endpoint.last_seen.is_some());
}

#[tokio::test]
async fn unknown_chain_crawl_errors() {
    let app = common::app().await;
    assert!(app.state.crawler.crawl_chain("ghost").await.is_err());
}
