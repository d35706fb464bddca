//! Bitbucket/SonarCloud request executor.
//!
//! Every outbound call goes through [`BitbucketClient::execute`] (or its
//! streaming sibling), which consults the response cache, attaches
//! credentials, retries transient failures with backoff and turns terminal
//! non-2xx responses into [`ApiError`]s.

use crate::auth::CredentialProvider;
use crate::cache::{CacheContext, CacheKey, ResponseCache};
use crate::config::{ClientConfig, ClientConfigBuilder};
use crate::errors::{ApiError, ApiResult, ErrorKind};
use crate::logs::LogRetriever;
use crate::observability::{redact_header, Metrics, MetricsSnapshot, TracingHooks};
use crate::pagination::{PageIterator, PaginationOptions, Paginator};
use crate::resilience::{error_chain_text, is_transient_error_text, BackoffPolicy};
use crate::services::{AnalysisService, PipelinesService, PullRequestsService};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::{Client, Method, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Upstream API a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiTarget {
    /// Bitbucket Cloud (repositories, pull requests, pipelines).
    Pipelines,
    /// SonarCloud code analysis.
    Analysis,
}

/// Inclusive byte range for partial-content requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset, open-ended when `None`.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Renders the `Range` header value.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// One logical request.
///
/// Built with the `with_*` methods, then passed by reference to the executor,
/// which re-sends the same descriptor on every retry.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Bytes>,
    range: Option<ByteRange>,
    target: ApiTarget,
    timeout: Option<Duration>,
    accept: Option<&'static str>,
    cache_context: CacheContext,
    cache_ttl: Option<Duration>,
    cacheable: bool,
}

impl RequestDescriptor {
    /// Creates a descriptor for a path relative to the target's base URL, or
    /// for an absolute `http(s)://` URL used as-is.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            range: None,
            target: ApiTarget::Pipelines,
            timeout: None,
            accept: None,
            cache_context: CacheContext::default(),
            cache_ttl: None,
            cacheable: true,
        }
    }

    /// GET descriptor.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Addresses the request to another API.
    pub fn with_target(mut self, target: ApiTarget) -> Self {
        self.target = target;
        self
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Adds every field of a serializable struct as query parameters.
    pub fn with_query_params<P: Serialize>(mut self, params: &P) -> ApiResult<Self> {
        let encoded = serde_urlencoded::to_string(params).map_err(|e| {
            ApiError::configuration(format!("Failed to serialize parameters: {}", e))
        })?;
        self.query
            .extend(url::form_urlencoded::parse(encoded.as_bytes()).into_owned());
        Ok(self)
    }

    /// Sets a JSON body.
    pub fn with_json<B: Serialize>(mut self, body: &B) -> ApiResult<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| {
            ApiError::configuration(format!("Failed to serialize request body: {}", e))
        })?;
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Requests a byte range. Ranged responses are never cached.
    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some(ByteRange { start, end });
        self
    }

    /// Overrides the configured per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the `Accept` header.
    pub fn with_accept(mut self, accept: &'static str) -> Self {
        self.accept = Some(accept);
        self
    }

    /// Sets the domain context folded into the cache key.
    pub fn with_cache_context(mut self, context: CacheContext) -> Self {
        self.cache_context = context;
        self
    }

    /// Sets the cache TTL for a successful response.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Bypasses the cache for this request.
    pub fn without_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path or absolute URL.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Target API.
    pub fn target(&self) -> ApiTarget {
        self.target
    }

    /// Byte range, if any.
    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    /// Cache context.
    pub fn cache_context(&self) -> &CacheContext {
        &self.cache_context
    }

    fn uses_cache(&self) -> bool {
        self.method == Method::GET && self.cacheable && self.range.is_none()
    }
}

/// Buffered response of a successful call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status (200 for cache hits).
    pub status: u16,
    /// Response headers (empty for cache hits).
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// True if served from the response cache.
    pub from_cache: bool,
}

impl ApiResponse {
    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ApiError::decode(format!("Failed to deserialize response: {}", e)).with_cause(e)
        })
    }

    /// Body as UTF-8 text, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Why one network attempt failed before producing a response.
enum SendFailure {
    Transport(reqwest::Error),
    TimedOut(Duration),
}

impl SendFailure {
    fn describe(&self) -> String {
        match self {
            Self::Transport(e) => error_chain_text(e),
            Self::TimedOut(after) => format!("request timed out after {:?}", after),
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || is_transient_error_text(&self.describe()),
            Self::TimedOut(_) => true,
        }
    }

    fn into_error(self) -> ApiError {
        let detail = self.describe();
        let error = ApiError::no_response().with_detail(detail);
        match self {
            Self::Transport(e) => error.with_cause(e),
            Self::TimedOut(_) => error,
        }
    }
}

/// Bitbucket Pipelines / SonarCloud API client.
#[derive(Clone)]
pub struct BitbucketClient {
    http: Client,
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    cache: Arc<ResponseCache>,
    backoff: BackoffPolicy,
    metrics: Arc<Metrics>,
    hooks: TracingHooks,
}

impl std::fmt::Debug for BitbucketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitbucketClient")
            .field("base_url", &self.config.base_url)
            .field("analysis_base_url", &self.config.analysis_base_url)
            .finish_non_exhaustive()
    }
}

impl BitbucketClient {
    /// Creates a client with a cache built from configuration.
    pub fn new(config: ClientConfig, credentials: Arc<dyn CredentialProvider>) -> ApiResult<Self> {
        let cache = Arc::new(ResponseCache::from_config(&config.cache));
        Self::with_cache(config, credentials, cache)
    }

    /// Creates a client sharing an existing cache.
    pub fn with_cache(
        config: ClientConfig,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<ResponseCache>,
    ) -> ApiResult<Self> {
        config.validate()?;

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool.max_idle_per_host)
            .pool_idle_timeout(config.pool.idle_timeout)
            .build()
            .map_err(|e| {
                ApiError::configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            backoff: BackoffPolicy::from_config(&config.retry),
            hooks: TracingHooks::new(config.logging_enabled),
            config,
            credentials,
            cache,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Creates a new client builder.
    pub fn builder() -> BitbucketClientBuilder {
        BitbucketClientBuilder::new()
    }

    /// Gets the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Gets the response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Gets a snapshot of request metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn hooks(&self) -> TracingHooks {
        self.hooks
    }

    // Service accessors

    /// Gets the pipelines service.
    pub fn pipelines(&self) -> PipelinesService<'_> {
        PipelinesService::new(self)
    }

    /// Gets the pull requests service.
    pub fn pull_requests(&self) -> PullRequestsService<'_> {
        PullRequestsService::new(self)
    }

    /// Gets the SonarCloud analysis service.
    pub fn analysis(&self) -> AnalysisService<'_> {
        AnalysisService::new(self)
    }

    /// Gets the step log retriever.
    pub fn logs(&self) -> LogRetriever {
        LogRetriever::new(self.clone())
    }

    // Collections

    /// Starts a paginator over a paged collection.
    pub fn paginate(&self, endpoint: impl Into<String>, options: PaginationOptions) -> Paginator<'_> {
        Paginator::new(self, endpoint, options)
    }

    /// Starts a lazy item iterator over a paged collection.
    pub fn iterate<T: DeserializeOwned>(
        &self,
        endpoint: impl Into<String>,
        options: PaginationOptions,
    ) -> PageIterator<'_, T> {
        PageIterator::new(self.paginate(endpoint, options))
    }

    // Typed helpers

    /// Makes a GET request.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.execute_json(&RequestDescriptor::get(path), &CancellationToken::new())
            .await
    }

    /// Makes a GET request with query parameters.
    pub async fn get_with_params<T: DeserializeOwned, P: Serialize>(
        &self,
        path: &str,
        params: &P,
    ) -> ApiResult<T> {
        let descriptor = RequestDescriptor::get(path).with_query_params(params)?;
        self.execute_json(&descriptor, &CancellationToken::new()).await
    }

    /// Makes a POST request.
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> ApiResult<T> {
        let descriptor = RequestDescriptor::new(Method::POST, path).with_json(body)?;
        self.execute_json(&descriptor, &CancellationToken::new()).await
    }

    /// Makes a PUT request.
    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> ApiResult<T> {
        let descriptor = RequestDescriptor::new(Method::PUT, path).with_json(body)?;
        self.execute_json(&descriptor, &CancellationToken::new()).await
    }

    /// Makes a DELETE request.
    pub async fn delete(&self, path: &str) -> ApiResult<()> {
        self.execute(&RequestDescriptor::new(Method::DELETE, path), &CancellationToken::new())
            .await?;
        Ok(())
    }

    /// Executes a descriptor and decodes the JSON body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> ApiResult<T> {
        self.execute(descriptor, cancel).await?.json()
    }

    /// Executes one logical request.
    ///
    /// GETs are answered from the cache when possible. Retries are internal;
    /// the caller sees only the final outcome.
    pub async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> ApiResult<ApiResponse> {
        let url = self.resolve_url(descriptor)?;

        let cache_key = if descriptor.uses_cache() && self.cache.is_enabled() {
            let key = Self::cache_key(&url, descriptor.cache_context());
            if let Some(body) = self.cache.get(&key) {
                self.metrics.record_cache_hit();
                self.hooks.on_cache_hit(url.as_str());
                return Ok(ApiResponse {
                    status: 200,
                    headers: HeaderMap::new(),
                    body,
                    from_cache: true,
                });
            }
            self.metrics.record_cache_miss();
            Some(key)
        } else {
            None
        };

        let response = self.send_with_retry(descriptor, &url, cancel, false).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = Self::read_body(response, cancel).await?;

        if let Some(key) = cache_key {
            let ttl = descriptor
                .cache_ttl
                .unwrap_or_else(|| self.cache.default_ttl());
            self.cache.set(key, body.clone(), ttl);
            self.hooks.on_cache_store(url.as_str(), ttl);
        }

        Ok(ApiResponse {
            status,
            headers,
            body,
            from_cache: false,
        })
    }

    /// Executes a request and hands back the unread response for streaming.
    ///
    /// Never cached. The configured timeout bounds only the wait for response
    /// headers, so long bodies can be read incrementally.
    pub async fn execute_streaming(
        &self,
        descriptor: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> ApiResult<Response> {
        let url = self.resolve_url(descriptor)?;
        self.send_with_retry(descriptor, &url, cancel, true).await
    }

    async fn send_with_retry(
        &self,
        descriptor: &RequestDescriptor,
        url: &Url,
        cancel: &CancellationToken,
        streaming: bool,
    ) -> ApiResult<Response> {
        if !self.credentials.is_valid(descriptor.target()).await {
            return Err(ApiError::authentication("Credentials are not valid"));
        }
        let auth = self
            .credentials
            .auth_method(descriptor.target())
            .await?
            .header_value()?;

        let method = descriptor.method().as_str();
        let timeout = descriptor.timeout.unwrap_or(self.config.timeout);
        let max_attempts = self.config.retry.effective_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ApiError::cancelled("Request cancelled"));
            }

            let request = self.build_request(descriptor, url, &auth, (!streaming).then_some(timeout));
            self.metrics.record_request();
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ApiError::cancelled("Request cancelled"));
                }
                result = Self::send(request, streaming.then_some(timeout)) => result,
            };

            let error = match outcome {
                Ok(response) if response.status().is_success() => {
                    self.metrics.record_latency(started.elapsed());
                    self.metrics.record_success();
                    self.hooks.on_request_complete(
                        method,
                        url.as_str(),
                        response.status().as_u16(),
                        started.elapsed(),
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (status >= 500 || status == 429) && attempt < max_attempts {
                        let delay = self.backoff.delay(attempt, Some(status));
                        let reason = format!("HTTP {}", status);
                        drop(response);
                        self.pause_before_retry(method, url, attempt, delay, &reason, cancel)
                            .await?;
                        continue;
                    }

                    let headers = response.headers().clone();
                    match Self::read_body(response, cancel).await {
                        Ok(body) => ApiError::from_response(status, &headers, &body),
                        Err(read_error) if read_error.kind() == ErrorKind::Cancelled => {
                            return Err(read_error);
                        }
                        Err(read_error) => ApiError::from_response(status, &headers, &[])
                            .with_detail(format!(
                                "Failed to read error body: {}",
                                read_error.detail().unwrap_or(read_error.message())
                            ))
                            .with_cause(read_error),
                    }
                }
                Err(failure) => {
                    if failure.is_transient() && attempt < max_attempts {
                        let delay = self.backoff.delay(attempt, None);
                        let reason = failure.describe();
                        self.pause_before_retry(method, url, attempt, delay, &reason, cancel)
                            .await?;
                        continue;
                    }
                    failure.into_error()
                }
            };

            self.metrics.record_latency(started.elapsed());
            self.metrics.record_failure();
            self.hooks
                .on_request_error(method, url.as_str(), &error.to_string());
            return Err(error);
        }
    }

    async fn send(
        request: reqwest::RequestBuilder,
        header_timeout: Option<Duration>,
    ) -> Result<Response, SendFailure> {
        match header_timeout {
            Some(limit) => match tokio::time::timeout(limit, request.send()).await {
                Ok(result) => result.map_err(SendFailure::Transport),
                Err(_) => Err(SendFailure::TimedOut(limit)),
            },
            None => request.send().await.map_err(SendFailure::Transport),
        }
    }

    async fn pause_before_retry(
        &self,
        method: &str,
        url: &Url,
        attempt: u32,
        delay: Duration,
        reason: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<()> {
        self.metrics.record_retry();
        self.hooks
            .on_retry(method, url.as_str(), attempt, delay, reason);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::cancelled("Request cancelled during retry backoff")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn read_body(response: Response, cancel: &CancellationToken) -> ApiResult<Bytes> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::cancelled("Request cancelled while reading body")),
            body = response.bytes() => body.map_err(|e| {
                ApiError::network("Failed to read response body")
                    .with_detail(error_chain_text(&e))
                    .with_cause(e)
            }),
        }
    }

    fn build_request(
        &self,
        descriptor: &RequestDescriptor,
        url: &Url,
        auth: &HeaderValue,
        timeout: Option<Duration>,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(descriptor.method().clone(), url.clone())
            .header(AUTHORIZATION, auth.clone())
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, descriptor.accept.unwrap_or("application/json"));

        if let Some(limit) = timeout {
            request = request.timeout(limit);
        }
        if let Some(range) = descriptor.range() {
            request = request.header(RANGE, range.header_value());
        }
        if let Some(ref bytes) = descriptor.body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(bytes.clone());
        }

        if self.config.logging_enabled {
            tracing::trace!(
                method = %descriptor.method(),
                url = %url,
                authorization = %redact_header(AUTHORIZATION.as_str(), auth.to_str().unwrap_or_default()),
                "Sending API request"
            );
        }

        request
    }

    /// Resolves a descriptor to a full URL with its query string.
    pub fn resolve_url(&self, descriptor: &RequestDescriptor) -> ApiResult<Url> {
        let path = descriptor.path();
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            let base = match descriptor.target() {
                ApiTarget::Pipelines => &self.config.base_url,
                ApiTarget::Analysis => &self.config.analysis_base_url,
            };
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let mut url = Url::parse(&raw).map_err(|e| {
            ApiError::configuration(format!("Invalid request URL {}: {}", raw, e))
        })?;
        if !descriptor.query.is_empty() {
            url.query_pairs_mut().extend_pairs(descriptor.query.iter());
        }
        Ok(url)
    }

    fn cache_key(url: &Url, context: &CacheContext) -> CacheKey {
        let mut resource = url.clone();
        resource.set_query(None);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        CacheKey::new(
            resource.as_str(),
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            context,
        )
    }
}

/// Builder for BitbucketClient.
pub struct BitbucketClientBuilder {
    config_builder: ClientConfigBuilder,
    credentials: Option<Arc<dyn CredentialProvider>>,
    cache: Option<Arc<ResponseCache>>,
}

impl BitbucketClientBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            config_builder: ClientConfig::builder(),
            credentials: None,
            cache: None,
        }
    }

    /// Replaces the whole configuration builder.
    pub fn config(mut self, builder: ClientConfigBuilder) -> Self {
        self.config_builder = builder;
        self
    }

    /// Sets the Bitbucket base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.base_url(url);
        self
    }

    /// Sets the SonarCloud base URL.
    pub fn analysis_base_url(mut self, url: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.analysis_base_url(url);
        self
    }

    /// Sets the credential provider.
    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Uses a static bearer token for every API.
    pub fn bearer(self, token: impl Into<String>) -> Self {
        self.credentials(Arc::new(crate::auth::StaticCredentialProvider::new(
            crate::auth::AuthMethod::bearer(token),
        )))
    }

    /// Shares an existing cache.
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.timeout(timeout);
        self
    }

    /// Sets the User-Agent.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.user_agent(ua);
        self
    }

    /// Disables retries.
    pub fn no_retry(mut self) -> Self {
        self.config_builder = self.config_builder.no_retry();
        self
    }

    /// Builds the client.
    pub fn build(self) -> ApiResult<BitbucketClient> {
        let config = self.config_builder.build()?;
        let credentials = self
            .credentials
            .ok_or_else(|| ApiError::configuration("A credential provider is required"))?;
        match self.cache {
            Some(cache) => BitbucketClient::with_cache(config, credentials, cache),
            None => BitbucketClient::new(config, credentials),
        }
    }
}

impl Default for BitbucketClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
