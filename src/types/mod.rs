//! Core data types for the Bitbucket and SonarCloud APIs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hyperlink object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Absolute URL.
    pub href: String,
}

/// Links attached to a resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Links {
    /// Canonical API URL.
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<Link>,
    /// Browser URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<Link>,
    /// Out-of-band log location (pipeline steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Link>,
    /// Any other named links.
    #[serde(flatten)]
    pub other: HashMap<String, serde_json::Value>,
}

/// Bitbucket account (minimal representation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account UUID.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Display name.
    pub display_name: String,
    /// Nickname.
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Build/commit status state, shared by commit statuses and analysis caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildState {
    /// Build succeeded.
    Successful,
    /// Build failed.
    Failed,
    /// Build is running.
    #[serde(rename = "INPROGRESS")]
    InProgress,
    /// Build was stopped.
    Stopped,
    /// Pipeline is queued or waiting.
    Pending,
    /// Unrecognised state.
    #[serde(other)]
    Unknown,
}

impl BuildState {
    /// Returns true once the build can no longer change.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Stopped)
    }

    /// Returns true while the build may still change.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::InProgress | Self::Pending)
    }
}

/// Result of a completed pipeline or step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResult {
    /// Result name (SUCCESSFUL, FAILED, STOPPED, ERROR, ...).
    pub name: String,
}

/// Pipeline or step state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// State name (PENDING, IN_PROGRESS, COMPLETED, ...).
    pub name: String,
    /// Result, once completed.
    #[serde(default)]
    pub result: Option<StateResult>,
}

impl PipelineState {
    /// Collapses the state/result pair into a build state.
    pub fn build_state(&self) -> BuildState {
        match self.name.as_str() {
            "PENDING" | "PARSING" => BuildState::Pending,
            "IN_PROGRESS" | "RUNNING" => BuildState::InProgress,
            "COMPLETED" => match self.result.as_ref().map(|r| r.name.as_str()) {
                Some("SUCCESSFUL") => BuildState::Successful,
                Some("FAILED") | Some("ERROR") => BuildState::Failed,
                Some("STOPPED") => BuildState::Stopped,
                _ => BuildState::Unknown,
            },
            _ => BuildState::Unknown,
        }
    }
}

/// Reference a pipeline ran against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTarget {
    /// Branch or tag name.
    #[serde(default)]
    pub ref_name: Option<String>,
    /// Commit built.
    #[serde(default)]
    pub commit: Option<Commit>,
    /// Pull request, for PR pipelines.
    #[serde(default)]
    pub pullrequest: Option<PullRequestRef>,
}

/// Commit reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    /// Commit hash.
    pub hash: String,
}

/// Minimal pull request reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRef {
    /// Pull request id.
    pub id: u64,
}

/// A pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline UUID (with braces).
    pub uuid: String,
    /// Sequential build number.
    pub build_number: u64,
    /// Current state.
    pub state: PipelineState,
    /// What the pipeline built.
    #[serde(default)]
    pub target: Option<PipelineTarget>,
    /// Creation time.
    pub created_on: DateTime<Utc>,
    /// Completion time.
    #[serde(default)]
    pub completed_on: Option<DateTime<Utc>>,
    /// Build duration in seconds.
    #[serde(default)]
    pub duration_in_seconds: Option<u64>,
}

/// A step within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Step UUID (with braces).
    pub uuid: String,
    /// Step name.
    #[serde(default)]
    pub name: Option<String>,
    /// Current state.
    #[serde(default)]
    pub state: Option<PipelineState>,
    /// Start time.
    #[serde(default)]
    pub started_on: Option<DateTime<Utc>>,
    /// Completion time.
    #[serde(default)]
    pub completed_on: Option<DateTime<Utc>>,
    /// Resource links.
    #[serde(default)]
    pub links: Links,
}

impl PipelineStep {
    /// Direct log link advertised by the step, if any.
    pub fn log_href(&self) -> Option<&str> {
        self.links.log.as_ref().map(|l| l.href.as_str())
    }
}

/// Pull request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PullRequestState {
    /// Open.
    Open,
    /// Merged.
    Merged,
    /// Declined.
    Declined,
    /// Superseded.
    Superseded,
}

impl PullRequestState {
    /// Query value used by the list endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Merged => "MERGED",
            Self::Declined => "DECLINED",
            Self::Superseded => "SUPERSEDED",
        }
    }
}

/// Branch reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name.
    pub name: String,
}

/// One side of a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestEndpoint {
    /// Branch.
    pub branch: Branch,
    /// Head commit.
    #[serde(default)]
    pub commit: Option<Commit>,
}

/// A pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    /// Pull request id.
    pub id: u64,
    /// Title.
    pub title: String,
    /// State.
    pub state: PullRequestState,
    /// Author.
    #[serde(default)]
    pub author: Option<Account>,
    /// Source branch.
    pub source: PullRequestEndpoint,
    /// Destination branch.
    pub destination: PullRequestEndpoint,
    /// Creation time.
    pub created_on: DateTime<Utc>,
    /// Last update time.
    pub updated_on: DateTime<Utc>,
    /// Resource links.
    #[serde(default)]
    pub links: Links,
}

/// Build status reported against a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitStatus {
    /// Status key.
    pub key: String,
    /// State.
    pub state: BuildState,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Link to the build.
    #[serde(default)]
    pub url: Option<String>,
    /// Last update time.
    #[serde(default)]
    pub updated_on: Option<DateTime<Utc>>,
}

/// Quality gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    /// Gate passed.
    Ok,
    /// Gate passed with warnings.
    Warn,
    /// Gate failed.
    Error,
    /// No gate computed yet.
    None,
}

/// Single quality gate condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCondition {
    /// Condition verdict.
    pub status: GateStatus,
    /// Metric checked.
    pub metric_key: String,
    /// Comparison operator.
    #[serde(default)]
    pub comparator: Option<String>,
    /// Threshold.
    #[serde(default)]
    pub error_threshold: Option<String>,
    /// Observed value.
    #[serde(default)]
    pub actual_value: Option<String>,
}

/// Quality gate status of a project or pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateStatus {
    /// Overall verdict.
    pub status: GateStatus,
    /// Conditions evaluated.
    #[serde(default)]
    pub conditions: Vec<GateCondition>,
}

/// Response envelope of the quality gate endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QualityGateResponse {
    pub project_status: QualityGateStatus,
}

/// A metric value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    /// Metric key.
    pub metric: String,
    /// Value, absent for metrics without data.
    #[serde(default)]
    pub value: Option<String>,
}

/// Component measures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentMeasures {
    /// Component key.
    pub key: String,
    /// Measures.
    #[serde(default)]
    pub measures: Vec<Measure>,
}

/// Response envelope of the measures endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MeasuresResponse {
    pub component: ComponentMeasures,
}
