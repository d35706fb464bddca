//! Retry policy for the request executor.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Multiplier applied to the computed delay after a 429 response.
pub const RATE_LIMIT_MULTIPLIER: u32 = 3;

/// Maximum jitter as a fraction of the computed delay.
pub const MAX_JITTER_FRACTION: f64 = 0.25;

/// Transport error fragments that indicate a transient failure.
pub const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "temporary failure",
    "no such host",
    "dns error",
];

/// Exponential backoff policy.
///
/// Computes delays only; the executor does the sleeping.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    /// Creates a new backoff policy.
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Creates a policy from retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.jitter)
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    ///
    /// `status` is the HTTP status of the failed attempt, or `None` for a
    /// transport error.
    pub fn delay(&self, attempt: u32, status: Option<u16>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let mut delay = self.base_delay.saturating_mul(1u32 << exponent);

        if status == Some(429) {
            delay = delay.saturating_mul(RATE_LIMIT_MULTIPLIER);
        }

        let mut delay = delay.min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let fraction = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
            delay = delay.saturating_add(delay.mul_f64(fraction)).min(self.max_delay);
        }

        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Returns true when a transport error message names a transient condition.
pub fn is_transient_error_text(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    TRANSIENT_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Flattens an error and its sources into one string.
pub fn error_chain_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
