//! Test doubles and JSON fixtures for exercising the client against mock servers.

use crate::auth::{AuthMethod, CredentialProvider};
use crate::client::ApiTarget;
use crate::errors::{ApiError, ApiResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Credential provider whose validity can be flipped at runtime.
#[derive(Debug, Clone)]
pub struct MockCredentialProvider {
    token: String,
    valid: Arc<AtomicBool>,
    lookups: Arc<AtomicUsize>,
    fail_lookup: bool,
}

impl MockCredentialProvider {
    /// Creates a valid provider issuing `Bearer <token>`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            valid: Arc::new(AtomicBool::new(true)),
            lookups: Arc::new(AtomicUsize::new(0)),
            fail_lookup: false,
        }
    }

    /// Creates a provider that reports itself invalid.
    pub fn invalid() -> Self {
        let provider = Self::new("invalid");
        provider.set_valid(false);
        provider
    }

    /// Makes `auth_method` fail with an authentication error.
    pub fn failing_lookup(mut self) -> Self {
        self.fail_lookup = true;
        self
    }

    /// Flips validity. Clones share the flag.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Number of `auth_method` calls so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for MockCredentialProvider {
    fn default() -> Self {
        Self::new("test-token")
    }
}

#[async_trait]
impl CredentialProvider for MockCredentialProvider {
    async fn auth_method(&self, _target: ApiTarget) -> ApiResult<AuthMethod> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup {
            return Err(ApiError::authentication("Mock credential lookup failed"));
        }
        Ok(AuthMethod::bearer(self.token.clone()))
    }

    async fn is_valid(&self, _target: ApiTarget) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

/// JSON fixtures shaped like Bitbucket and SonarCloud responses.
pub mod fixtures {
    use serde_json::{json, Value};

    /// A paged collection envelope.
    pub fn page(values: Vec<Value>, page: u32, next: Option<&str>) -> Value {
        let mut body = json!({
            "size": values.len(),
            "page": page,
            "pagelen": values.len().max(1),
            "values": values,
        });
        if let Some(next) = next {
            body["next"] = json!(next);
        }
        body
    }

    /// A Bitbucket error body.
    pub fn error(message: &str, detail: Option<&str>) -> Value {
        let mut error = json!({ "message": message });
        if let Some(detail) = detail {
            error["detail"] = json!(detail);
        }
        json!({ "type": "error", "error": error })
    }

    /// A completed pipeline.
    pub fn pipeline(uuid: &str, build_number: u64, result: &str) -> Value {
        json!({
            "uuid": uuid,
            "build_number": build_number,
            "state": {
                "name": "COMPLETED",
                "result": { "name": result }
            },
            "target": {
                "ref_name": "main",
                "commit": { "hash": "a1b2c3d4" }
            },
            "created_on": "2024-05-01T10:00:00Z",
            "completed_on": "2024-05-01T10:04:30Z",
            "duration_in_seconds": 270
        })
    }

    /// A pipeline step, optionally advertising a direct log link.
    pub fn step(uuid: &str, name: &str, log_href: Option<&str>) -> Value {
        let mut step = json!({
            "uuid": uuid,
            "name": name,
            "state": { "name": "COMPLETED", "result": { "name": "SUCCESSFUL" } },
            "links": {}
        });
        if let Some(href) = log_href {
            step["links"]["log"] = json!({ "href": href });
        }
        step
    }

    /// An open pull request.
    pub fn pull_request(id: u64, title: &str) -> Value {
        json!({
            "id": id,
            "title": title,
            "state": "OPEN",
            "author": { "display_name": "Dev" },
            "source": { "branch": { "name": "feature" }, "commit": { "hash": "f00d" } },
            "destination": { "branch": { "name": "main" } },
            "created_on": "2024-05-01T09:00:00Z",
            "updated_on": "2024-05-01T09:30:00Z",
            "links": {}
        })
    }

    /// A commit status.
    pub fn commit_status(key: &str, state: &str) -> Value {
        json!({
            "key": key,
            "state": state,
            "name": key,
            "url": "https://ci.example.com/build/1"
        })
    }

    /// A quality gate response with one condition.
    pub fn quality_gate(status: &str) -> Value {
        json!({
            "projectStatus": {
                "status": status,
                "conditions": [{
                    "status": status,
                    "metricKey": "new_coverage",
                    "comparator": "LT",
                    "errorThreshold": "80",
                    "actualValue": "85.2"
                }]
            }
        })
    }

    /// A measures response.
    pub fn measures(component: &str, measures: &[(&str, &str)]) -> Value {
        let measures: Vec<Value> = measures
            .iter()
            .map(|(metric, value)| json!({ "metric": metric, "value": value }))
            .collect();
        json!({ "component": { "key": component, "measures": measures } })
    }
}
