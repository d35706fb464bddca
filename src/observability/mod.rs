//! Request metrics and tracing hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters for executor activity.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    requests_retried: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a network attempt.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful logical request.
    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed logical request.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retry.
    pub fn record_retry(&self) {
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records request latency.
    pub fn record_latency(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        let total = self.latency_total_us.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            total / count
        }
    }

    /// Gets a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_retried: self.requests_retried.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.requests_total,
            &self.requests_success,
            &self.requests_failed,
            &self.requests_retried,
            &self.cache_hits,
            &self.cache_misses,
            &self.latency_total_us,
            &self.latency_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Network attempts, including retries.
    pub requests_total: u64,
    /// Logical requests that succeeded.
    pub requests_success: u64,
    /// Logical requests that failed.
    pub requests_failed: u64,
    /// Retries performed.
    pub requests_retried: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Average latency in microseconds.
    pub average_latency_us: u64,
}

/// Tracing hooks, silenced when request logging is off.
#[derive(Debug, Clone, Copy)]
pub struct TracingHooks {
    enabled: bool,
}

impl TracingHooks {
    /// Creates hooks.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Logs a cache hit.
    pub fn on_cache_hit(&self, url: &str) {
        if self.enabled {
            debug!(url = %url, "Served from response cache");
        }
    }

    /// Logs a cache store.
    pub fn on_cache_store(&self, url: &str, ttl: Duration) {
        if self.enabled {
            debug!(url = %url, ttl_secs = ttl.as_secs(), "Stored response in cache");
        }
    }

    /// Logs the completion of a request.
    pub fn on_request_complete(&self, method: &str, url: &str, status: u16, duration: Duration) {
        if self.enabled {
            info!(
                method = %method,
                url = %url,
                status = status,
                duration_ms = duration.as_millis() as u64,
                "API request completed"
            );
        }
    }

    /// Logs a terminal request error.
    pub fn on_request_error(&self, method: &str, url: &str, error: &str) {
        if self.enabled {
            error!(method = %method, url = %url, error = %error, "API request failed");
        }
    }

    /// Logs a retry attempt.
    pub fn on_retry(&self, method: &str, url: &str, attempt: u32, delay: Duration, reason: &str) {
        if self.enabled {
            warn!(
                method = %method,
                url = %url,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Retrying API request"
            );
        }
    }

    /// Logs a failed log-retrieval fallback step.
    pub fn on_log_fallback(&self, attempt: &str, error: &str) {
        if self.enabled {
            debug!(attempt = %attempt, error = %error, "Log endpoint failed, trying next");
        }
    }

    /// Logs the end of a log streaming session.
    pub fn on_stream_closed(&self, session: &str, lines: u64, outcome: &str) {
        if self.enabled {
            debug!(session = %session, lines = lines, outcome = %outcome, "Log stream closed");
        }
    }
}

/// Sensitive headers that should be redacted in logs.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Redacts sensitive values in headers.
pub fn redact_header(name: &str, value: &str) -> String {
    if SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}
