//! SonarCloud analysis operations.
//!
//! Analysis results are immutable once the build that produced them has
//! finished, so responses are cached for a lifetime derived from the build
//! state the caller observed.

use crate::cache::{CacheContext, CacheTtl};
use crate::client::{ApiTarget, BitbucketClient, RequestDescriptor};
use crate::errors::{ApiError, ApiResult, ErrorKind};
use crate::types::{BuildState, ComponentMeasures, MeasuresResponse, QualityGateResponse, QualityGateStatus};
use tokio_util::sync::CancellationToken;

/// Service for SonarCloud analysis results.
pub struct AnalysisService<'a> {
    client: &'a BitbucketClient,
}

impl<'a> AnalysisService<'a> {
    /// Creates a new analysis service.
    pub fn new(client: &'a BitbucketClient) -> Self {
        Self { client }
    }

    /// Gets the quality gate status of a project, or of one of its pull requests.
    ///
    /// `build_state` is the state of the build that produced the analysis and
    /// selects how long the result is cached.
    pub async fn quality_gate_status(
        &self,
        project_key: &str,
        pull_request_id: Option<u64>,
        build_state: Option<BuildState>,
        cancel: &CancellationToken,
    ) -> ApiResult<QualityGateStatus> {
        let descriptor = analysis_request(
            "api/qualitygates/project_status",
            pull_request_id,
            build_state,
        )
        .with_query("projectKey", non_empty("project key", project_key)?);

        let response: QualityGateResponse = self.client.execute_json(&descriptor, cancel).await?;
        Ok(response.project_status)
    }

    /// Gets metric values of a component.
    pub async fn measures(
        &self,
        component: &str,
        metric_keys: &[&str],
        pull_request_id: Option<u64>,
        build_state: Option<BuildState>,
        cancel: &CancellationToken,
    ) -> ApiResult<ComponentMeasures> {
        if metric_keys.is_empty() {
            return Err(ApiError::new(
                ErrorKind::Validation,
                "At least one metric key is required",
            ));
        }

        let descriptor = analysis_request("api/measures/component", pull_request_id, build_state)
            .with_query("component", non_empty("component", component)?)
            .with_query("metricKeys", metric_keys.join(","));

        let response: MeasuresResponse = self.client.execute_json(&descriptor, cancel).await?;
        Ok(response.component)
    }
}

fn analysis_request(
    path: &str,
    pull_request_id: Option<u64>,
    build_state: Option<BuildState>,
) -> RequestDescriptor {
    let descriptor = RequestDescriptor::get(path)
        .with_target(ApiTarget::Analysis)
        .with_cache_ttl(CacheTtl::for_build_state(build_state));

    match pull_request_id {
        Some(id) => descriptor
            .with_query("pullRequest", id.to_string())
            .with_cache_context(CacheContext::pull_request(id)),
        None => descriptor,
    }
}

fn non_empty<'a>(name: &str, value: &'a str) -> ApiResult<&'a str> {
    if value.trim().is_empty() {
        return Err(ApiError::new(
            ErrorKind::Validation,
            format!("The {} must not be empty", name),
        ));
    }
    Ok(value)
}
