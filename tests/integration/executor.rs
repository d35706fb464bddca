//! Request executor behaviour: retries, error parsing, auth and cancellation.

use super::*;
use integrations_bitbucket::mocks::{fixtures, MockCredentialProvider};
use integrations_bitbucket::{ErrorKind, RequestDescriptor};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_retries_server_error_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/thing"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/thing"))
        .respond_with(json_response(200, json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let descriptor = RequestDescriptor::get("/thing").without_cache();
    let response = assert_ok!(client.execute(&descriptor, &CancellationToken::new()).await);

    assert_eq!(response.status, 200);
    assert_eq!(response.json::<serde_json::Value>().unwrap(), json!({"ok": true}));
    let metrics = client.metrics();
    assert_eq!(metrics.requests_total, 3);
    assert_eq!(metrics.requests_retried, 2);
    assert_eq!(metrics.requests_success, 1);
}

#[tokio::test]
async fn test_rate_limit_exhausts_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(
            json_response(429, fixtures::error("Too many requests", None))
                .insert_header("X-Request-Id", "req-429"),
        )
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = assert_err!(client.get::<serde_json::Value>("/limited").await);

    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert!(err.is_retryable());
    assert!(err.is_rate_limit());
    assert_eq!(err.status_code(), Some(429));
    assert_eq!(err.request_id(), Some("req-429"));
    assert_eq!(err.message(), "Too many requests");
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(json_response(
            404,
            fixtures::error("Repository not found", Some("ws/nope")),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = assert_err!(client.get::<serde_json::Value>("/missing").await);

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retryable());
    assert_eq!(err.message(), "Repository not found");
    assert_eq!(err.detail(), Some("ws/nope"));
}

#[tokio::test]
async fn test_unparseable_error_body_uses_generic_message() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(400).set_body_string("<html>nope</html>"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = assert_err!(client.get::<serde_json::Value>("/bad").await);

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.message(), "Bad request");
    assert_eq!(err.detail(), Some("<html>nope</html>"));
}

#[tokio::test]
async fn test_retries_disabled_sends_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut retry = fast_retry(5);
    retry.enabled = false;
    let client = client_with(&server, retry, MockCredentialProvider::default());
    let err = assert_err!(client.get::<serde_json::Value>("/flaky").await);

    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.message(), "Internal server error");
}

#[tokio::test]
async fn test_invalid_credentials_fail_fast() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_with(&server, fast_retry(3), MockCredentialProvider::invalid());
    let err = assert_err!(client.get::<serde_json::Value>("/anything").await);

    assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[tokio::test]
async fn test_sends_auth_and_accept_headers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("Authorization", "Bearer test-token"))
        .and(header("Accept", "application/json"))
        .respond_with(json_response(200, json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert_ok!(client.get::<serde_json::Value>("/secure").await);
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/statuses"))
        .and(wiremock::matchers::body_json(json!({"key": "build", "state": "SUCCESSFUL"})))
        .respond_with(json_response(201, fixtures::commit_status("build", "SUCCESSFUL")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let status: integrations_bitbucket::CommitStatus = client
        .post("/statuses", &json!({"key": "build", "state": "SUCCESSFUL"}))
        .await
        .unwrap();
    assert_eq!(status.key, "build");
}

#[tokio::test]
async fn test_cancellation_stops_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow-fail"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let retry = RetryConfig {
        max_attempts: 5,
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
        jitter: false,
        enabled: true,
    };
    let client = client_with(&server, retry, MockCredentialProvider::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let descriptor = RequestDescriptor::get("/slow-fail");
    let err = assert_err!(client.execute(&descriptor, &cancel).await);

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(client.metrics().requests_total, 1);
}

#[tokio::test]
async fn test_cancelled_token_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = assert_err!(client.execute(&RequestDescriptor::get("/x"), &cancel).await);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_timeout_is_retried_then_reported_as_network() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/hang"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let config = ClientConfig::builder()
        .base_url(server.uri())
        .timeout(Duration::from_millis(50))
        .retry(fast_retry(2))
        .build()
        .unwrap();
    let client = integrations_bitbucket::BitbucketClient::new(
        config,
        Arc::new(MockCredentialProvider::default()),
    )
    .unwrap();

    let err = assert_err!(client.get::<serde_json::Value>("/hang").await);
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.message(), "No response received");
}

#[tokio::test]
async fn test_typed_helpers_send_expected_requests() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repositories/ws/repo/pullrequests"))
        .and(query_param("state", "OPEN"))
        .respond_with(json_response(200, json!({"size": 0})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repositories/ws/repo/pullrequests/5"))
        .and(wiremock::matchers::body_json(json!({"title": "Renamed"})))
        .respond_with(json_response(200, fixtures::pull_request(5, "Renamed")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/repositories/ws/repo/pipelines_config/schedules/s1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let listing: serde_json::Value = client
        .get_with_params("/repositories/ws/repo/pullrequests", &vec![("state", "OPEN")])
        .await
        .unwrap();
    assert_eq!(listing["size"], 0);

    let pr: integrations_bitbucket::PullRequest = client
        .put("/repositories/ws/repo/pullrequests/5", &json!({"title": "Renamed"}))
        .await
        .unwrap();
    assert_eq!(pr.title, "Renamed");

    assert_ok!(client.delete("/repositories/ws/repo/pipelines_config/schedules/s1").await);
}

#[tokio::test]
async fn test_connection_refused_is_retried_until_attempts_run_out() {
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = client_at(
        &format!("http://{}", address),
        fast_retry(3),
        Arc::new(MockCredentialProvider::default()),
    );
    let err = assert_err!(client.get::<serde_json::Value>("/unreachable").await);

    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.message(), "No response received");
    let metrics = client.metrics();
    assert_eq!(metrics.requests_total, 3);
    assert_eq!(metrics.requests_retried, 2);
}

#[tokio::test]
async fn test_non_transient_transport_error_is_not_retried() {
    let server = MockServer::start().await;
    let client = client_for(&server);

    // Plain-HTTP server addressed over https: the failure is not transient.
    let descriptor = RequestDescriptor::get(format!("https://{}/thing", server.address()));
    let err = assert_err!(client.execute(&descriptor, &CancellationToken::new()).await);

    assert_eq!(err.kind(), ErrorKind::Network);
    let metrics = client.metrics();
    assert_eq!(metrics.requests_total, 1);
    assert_eq!(metrics.requests_retried, 0);
}

/// Serves a 400 whose body is shorter than its `Content-Length`.
///
/// With `hold` the connection stays open after the partial body, otherwise it
/// is closed at once.
async fn truncated_error_server(hold: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 100\r\n\r\npartial")
                    .await;
                if hold {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            });
        }
    });
    format!("http://{}", address)
}

#[tokio::test]
async fn test_cancellation_while_reading_error_body() {
    let base = truncated_error_server(true).await;
    let client = client_at(&base, fast_retry(1), Arc::new(MockCredentialProvider::default()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = assert_err!(client.execute(&RequestDescriptor::get("/broken"), &cancel).await);

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_unreadable_error_body_is_reported() {
    let base = truncated_error_server(false).await;
    let client = client_at(&base, fast_retry(1), Arc::new(MockCredentialProvider::default()));

    let err = assert_err!(
        client
            .execute(&RequestDescriptor::get("/broken"), &CancellationToken::new())
            .await
    );

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.status_code(), Some(400));
    assert!(
        err.detail().unwrap_or_default().starts_with("Failed to read error body"),
        "{:?}",
        err.detail()
    );
}
