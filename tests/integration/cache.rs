//! Response cache behaviour through the executor.

use super::*;
use integrations_bitbucket::mocks::{fixtures, MockCredentialProvider};
use integrations_bitbucket::{
    BuildState, CacheContext, ClientConfig, GateStatus, RequestDescriptor,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer};

#[tokio::test]
async fn test_second_get_is_served_from_cache() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repositories/ws/repo"))
        .respond_with(json_response(200, json!({"slug": "repo"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let descriptor = RequestDescriptor::get("/repositories/ws/repo");

    let first = client.execute(&descriptor, &cancel).await.unwrap();
    let second = client.execute(&descriptor, &cancel).await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.body, second.body);
    assert_eq!(client.metrics().cache_hits, 1);
}

#[tokio::test]
async fn test_expired_entry_refetches() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/short"))
        .respond_with(json_response(200, json!({"n": 1})))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let descriptor = RequestDescriptor::get("/short").with_cache_ttl(Duration::from_millis(50));

    client.execute(&descriptor, &cancel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let again = client.execute(&descriptor, &cancel).await.unwrap();

    assert!(!again.from_cache);
}

#[tokio::test]
async fn test_query_order_shares_entry_and_context_splits_it() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gate"))
        .respond_with(json_response(200, json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();

    let a = RequestDescriptor::get("/gate")
        .with_query("a", "1")
        .with_query("b", "2");
    let b = RequestDescriptor::get("/gate")
        .with_query("b", "2")
        .with_query("a", "1");
    let pr = a.clone().with_cache_context(CacheContext::pull_request(9));

    assert!(!client.execute(&a, &cancel).await.unwrap().from_cache);
    assert!(client.execute(&b, &cancel).await.unwrap().from_cache);
    assert!(!client.execute(&pr, &cancel).await.unwrap().from_cache);
}

#[tokio::test]
async fn test_errors_and_ranges_are_not_cached() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(json_response(404, fixtures::error("Gone", None)))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ranged"))
        .respond_with(json_response(200, json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        assert!(client.execute(&RequestDescriptor::get("/gone"), &cancel).await.is_err());
        let ranged = RequestDescriptor::get("/ranged").with_range(0, Some(9));
        assert!(!client.execute(&ranged, &cancel).await.unwrap().from_cache);
    }
    assert!(client.cache().is_empty());
}

#[tokio::test]
async fn test_disabled_cache_always_hits_network() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nocache"))
        .respond_with(json_response(200, json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let config = ClientConfig::builder()
        .base_url(server.uri())
        .no_cache()
        .build()
        .unwrap();
    let client = BitbucketClient::new(config, Arc::new(MockCredentialProvider::default())).unwrap();

    client.get::<serde_json::Value>("/nocache").await.unwrap();
    client.get::<serde_json::Value>("/nocache").await.unwrap();
}

#[tokio::test]
async fn test_analysis_results_cached_per_pull_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sonar/api/qualitygates/project_status"))
        .and(query_param("projectKey", "ws_repo"))
        .and(query_param("pullRequest", "12"))
        .respond_with(json_response(200, fixtures::quality_gate("OK")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sonar/api/qualitygates/project_status"))
        .and(query_param("projectKey", "ws_repo"))
        .and(query_param("pullRequest", "13"))
        .respond_with(json_response(200, fixtures::quality_gate("ERROR")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let analysis = client.analysis();

    for _ in 0..2 {
        let gate = analysis
            .quality_gate_status("ws_repo", Some(12), Some(BuildState::Successful), &cancel)
            .await
            .unwrap();
        assert_eq!(gate.status, GateStatus::Ok);
    }
    let other = analysis
        .quality_gate_status("ws_repo", Some(13), Some(BuildState::InProgress), &cancel)
        .await
        .unwrap();
    assert_eq!(other.status, GateStatus::Error);
    assert_eq!(client.cache().len(), 2);
}
