//! Pull request operations.

use super::repository_path;
use crate::client::{BitbucketClient, RequestDescriptor};
use crate::errors::ApiResult;
use crate::pagination::{PageIterator, PaginationOptions};
use crate::types::{CommitStatus, PullRequest, PullRequestState};
use tokio_util::sync::CancellationToken;

/// Service for pull request operations.
pub struct PullRequestsService<'a> {
    client: &'a BitbucketClient,
}

impl<'a> PullRequestsService<'a> {
    /// Creates a new pull requests service.
    pub fn new(client: &'a BitbucketClient) -> Self {
        Self { client }
    }

    /// Lists pull requests in a repository, optionally filtered by state.
    pub async fn list(
        &self,
        workspace: &str,
        repo_slug: &str,
        state: Option<PullRequestState>,
        cancel: &CancellationToken,
    ) -> ApiResult<Vec<PullRequest>> {
        let path = format!("{}/pullrequests", repository_path(workspace, repo_slug)?);
        self.client
            .paginate(path, with_state(PaginationOptions::new(), state))
            .fetch_all_typed(cancel)
            .await
    }

    /// Iterates pull requests lazily.
    pub fn iter(
        &self,
        workspace: &str,
        repo_slug: &str,
        state: Option<PullRequestState>,
        options: PaginationOptions,
    ) -> ApiResult<PageIterator<'a, PullRequest>> {
        let path = format!("{}/pullrequests", repository_path(workspace, repo_slug)?);
        Ok(self.client.iterate(path, with_state(options, state)))
    }

    /// Gets a pull request.
    pub async fn get(
        &self,
        workspace: &str,
        repo_slug: &str,
        id: u64,
        cancel: &CancellationToken,
    ) -> ApiResult<PullRequest> {
        let path = format!(
            "{}/pullrequests/{}",
            repository_path(workspace, repo_slug)?,
            id
        );
        self.client
            .execute_json(&RequestDescriptor::get(path).without_cache(), cancel)
            .await
    }

    /// Lists build statuses reported against a pull request.
    pub async fn list_statuses(
        &self,
        workspace: &str,
        repo_slug: &str,
        id: u64,
        cancel: &CancellationToken,
    ) -> ApiResult<Vec<CommitStatus>> {
        let path = format!(
            "{}/pullrequests/{}/statuses",
            repository_path(workspace, repo_slug)?,
            id
        );
        self.client
            .paginate(path, PaginationOptions::new())
            .fetch_all_typed(cancel)
            .await
    }
}

fn with_state(options: PaginationOptions, state: Option<PullRequestState>) -> PaginationOptions {
    match state {
        Some(state) => options.query("state", state.as_str()),
        None => options,
    }
}
