//! Integration tests using WireMock
//!
//! These tests drive the client end to end against a mock HTTP server:
//! retries, caching, pagination, log fallback and streaming.

mod cache;
mod executor;
mod pagination;

use integrations_bitbucket::mocks::MockCredentialProvider;
use integrations_bitbucket::{BitbucketClient, ClientConfig, CredentialProvider, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use wiremock::{MockServer, ResponseTemplate};

/// Retry settings that keep backoff sleeps in the millisecond range.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
        enabled: true,
    }
}

/// Client pointed at the mock server for both APIs.
pub fn client_for(server: &MockServer) -> BitbucketClient {
    client_with(server, fast_retry(3), MockCredentialProvider::default())
}

/// Client with explicit retry settings and credentials.
pub fn client_with(
    server: &MockServer,
    retry: RetryConfig,
    credentials: MockCredentialProvider,
) -> BitbucketClient {
    client_at(&server.uri(), retry, Arc::new(credentials))
}

/// Client against an arbitrary base URL; the analysis API lives under `/sonar`.
pub fn client_at(
    base_url: &str,
    retry: RetryConfig,
    credentials: Arc<dyn CredentialProvider>,
) -> BitbucketClient {
    let config = ClientConfig::builder()
        .base_url(base_url)
        .analysis_base_url(format!("{}/sonar", base_url))
        .timeout(Duration::from_secs(5))
        .retry(retry)
        .build()
        .expect("valid config");
    BitbucketClient::new(config, credentials).expect("client builds")
}

/// Helper to create JSON response templates.
pub fn json_response(status: u16, body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(body)
}
