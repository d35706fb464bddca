//! Configuration types for the Bitbucket client.

use crate::errors::ApiError;
use std::time::Duration;

/// Default Bitbucket Cloud API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.bitbucket.org/2.0";

/// Default SonarCloud API base URL.
pub const DEFAULT_ANALYSIS_BASE_URL: &str = "https://sonarcloud.io";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = "integrations-bitbucket/0.1.0";

/// Default cache entry lifetime when the caller supplies none.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per logical request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
    /// Enable retries.
    pub enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
            enabled: true,
        }
    }
}

impl RetryConfig {
    /// Attempts actually made, honoring `enabled`.
    pub fn effective_attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the response cache.
    pub enabled: bool,
    /// TTL used when a request carries no domain-derived TTL.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host.
    pub max_idle_per_host: usize,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 20,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bitbucket API base URL.
    pub base_url: String,
    /// SonarCloud API base URL.
    pub analysis_base_url: String,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// User-Agent header.
    pub user_agent: String,
    /// Emit tracing events for requests, retries and cache activity.
    pub logging_enabled: bool,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Cache configuration.
    pub cache: CacheConfig,
    /// Connection pool configuration.
    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            analysis_base_url: DEFAULT_ANALYSIS_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            logging_enabled: false,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Loads overrides from the environment on top of the defaults.
    ///
    /// Recognised variables: `BITBUCKET_API_URL`, `SONARCLOUD_API_URL`,
    /// `BITBUCKET_TIMEOUT_SECS`, `BITBUCKET_MAX_RETRIES`, `BITBUCKET_CACHE`
    /// and `BITBUCKET_LOG_REQUESTS`.
    pub fn from_env() -> Result<Self, ApiError> {
        let mut builder = Self::builder();

        if let Ok(url) = std::env::var("BITBUCKET_API_URL") {
            builder = builder.base_url(url);
        }
        if let Ok(url) = std::env::var("SONARCLOUD_API_URL") {
            builder = builder.analysis_base_url(url);
        }
        if let Ok(secs) = std::env::var("BITBUCKET_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                ApiError::configuration(format!("BITBUCKET_TIMEOUT_SECS is not a number: {}", secs))
            })?;
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Ok(attempts) = std::env::var("BITBUCKET_MAX_RETRIES") {
            let attempts: u32 = attempts.parse().map_err(|_| {
                ApiError::configuration(format!(
                    "BITBUCKET_MAX_RETRIES is not a number: {}",
                    attempts
                ))
            })?;
            builder = builder.retry(RetryConfig {
                max_attempts: attempts,
                ..Default::default()
            });
        }
        if let Ok(flag) = std::env::var("BITBUCKET_CACHE") {
            if !parse_flag(&flag) {
                builder = builder.no_cache();
            }
        }
        if let Ok(flag) = std::env::var("BITBUCKET_LOG_REQUESTS") {
            builder = builder.logging(parse_flag(&flag));
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ApiError> {
        for (name, url) in [
            ("Base URL", &self.base_url),
            ("Analysis base URL", &self.analysis_base_url),
        ] {
            if url.is_empty() {
                return Err(ApiError::configuration(format!("{} cannot be empty", name)));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ApiError::configuration(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        if self.user_agent.is_empty() {
            return Err(ApiError::configuration("User-Agent cannot be empty"));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ApiError::configuration(
                "Retry base delay cannot exceed the maximum delay",
            ));
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Builder for ClientConfig.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    base_url: Option<String>,
    analysis_base_url: Option<String>,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
    logging_enabled: Option<bool>,
    retry: Option<RetryConfig>,
    cache: Option<CacheConfig>,
    pool: Option<PoolConfig>,
}

impl ClientConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the Bitbucket base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the SonarCloud base URL.
    pub fn analysis_base_url(mut self, url: impl Into<String>) -> Self {
        self.analysis_base_url = Some(url.into());
        self
    }

    /// Sets the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the User-Agent header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Turns request logging on or off.
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging_enabled = Some(enabled);
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Disables retries.
    pub fn no_retry(mut self) -> Self {
        self.retry = Some(RetryConfig {
            enabled: false,
            ..Default::default()
        });
        self
    }

    /// Sets the cache configuration.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Disables the response cache.
    pub fn no_cache(mut self) -> Self {
        self.cache = Some(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        self
    }

    /// Sets the connection pool configuration.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = Some(config);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<ClientConfig, ApiError> {
        let config = ClientConfig {
            base_url: self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            analysis_base_url: self
                .analysis_base_url
                .unwrap_or_else(|| DEFAULT_ANALYSIS_BASE_URL.to_string()),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            user_agent: self.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            logging_enabled: self.logging_enabled.unwrap_or(false),
            retry: self.retry.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            pool: self.pool.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}
