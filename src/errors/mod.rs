//! Error types for the Bitbucket and SonarCloud clients.

use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for client operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Headers consulted for a correlation id, in priority order.
pub const REQUEST_ID_HEADERS: &[&str] = &["X-Request-Id", "X-Request-ID", "Request-Id", "Request-ID"];

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request never produced a response (DNS, refused, TLS, timeout).
    Network,
    /// Missing or rejected credentials (401).
    Authentication,
    /// Credentials lack access to the resource (403).
    Permission,
    /// Resource does not exist (404).
    NotFound,
    /// Rate limit exceeded (429).
    RateLimit,
    /// Request was rejected as malformed (400, 422).
    Validation,
    /// Upstream failure (500, 502, 503).
    Server,
    /// Any other status.
    Unknown,
    /// The caller's cancellation token fired.
    Cancelled,
    /// A payload did not match the requested shape.
    Decode,
    /// Invalid client configuration.
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Server => "server",
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
            Self::Decode => "decode",
            Self::Configuration => "configuration",
        };
        f.write_str(tag)
    }
}

impl ErrorKind {
    /// Maps an HTTP status code to its classification.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Permission,
            404 => Self::NotFound,
            429 => Self::RateLimit,
            500 | 502 | 503 => Self::Server,
            _ => Self::Unknown,
        }
    }
}

/// Structured error body returned by both APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    detail: Option<String>,
}

/// API error with classification and upstream context.
#[derive(Error, Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    detail: Option<String>,
    status_code: Option<u16>,
    request_id: Option<String>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, ": {}", detail)?;
        }
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        if let Some(ref id) = self.request_id {
            write!(f, " [request_id: {}]", id)?;
        }
        Ok(())
    }
}

impl ApiError {
    /// Creates a new error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            status_code: None,
            request_id: None,
            cause: None,
        }
    }

    /// Sets the HTTP status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the correlation id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Gets the classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Gets the human message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the detail text.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Gets the HTTP status code.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Gets the request id.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::RateLimit | ErrorKind::Server | ErrorKind::Network
        )
    }

    /// Returns true if this is a rate limit error.
    pub fn is_rate_limit(&self) -> bool {
        self.kind == ErrorKind::RateLimit
    }

    /// Builds an error from a terminal non-2xx response.
    ///
    /// The body is decoded as `{"error": {"message", "detail"}}` when possible;
    /// otherwise a status-derived message is used and the raw body becomes the
    /// detail.
    pub fn from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let (message, detail) = match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(envelope) => (envelope.error.message, envelope.error.detail),
            Err(_) => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                let detail = if text.is_empty() {
                    status_phrase(status).to_string()
                } else {
                    text
                };
                (generic_message(status), Some(detail))
            }
        };

        let mut error = Self::new(ErrorKind::from_status(status), message).with_status(status);
        if let Some(detail) = detail {
            error = error.with_detail(detail);
        }
        if let Some(id) = request_id_from_headers(headers) {
            error = error.with_request_id(id);
        }
        error
    }

    /// Error for a call that never reached the server.
    pub fn no_response() -> Self {
        Self::new(ErrorKind::Network, "No response received")
    }

    // Convenience constructors

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message).with_status(404)
    }

    /// Creates a cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }
}

/// Builds an error from an optional response; `None` means the call never
/// reached the server.
pub fn parse_error_response(response: Option<(u16, &HeaderMap, &[u8])>) -> ApiError {
    match response {
        Some((status, headers, body)) => ApiError::from_response(status, headers, body),
        None => ApiError::no_response(),
    }
}

/// Reads the first populated correlation header.
pub fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    // Lookups are case-insensitive.
    REQUEST_ID_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
    })
}

fn generic_message(status: u16) -> String {
    match status {
        400 => "Bad request".to_string(),
        401 => "Authentication required".to_string(),
        403 => "Access forbidden".to_string(),
        404 => "Resource not found".to_string(),
        422 => "Validation failed".to_string(),
        429 => "Rate limit exceeded".to_string(),
        500 => "Internal server error".to_string(),
        502 => "Bad gateway".to_string(),
        503 => "Service unavailable".to_string(),
        _ => format!("HTTP {} error", status),
    }
}

fn status_phrase(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown status")
}
