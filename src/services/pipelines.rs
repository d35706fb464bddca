//! Pipeline operations.

use super::{path_segment, repository_path};
use crate::client::{BitbucketClient, RequestDescriptor};
use crate::errors::ApiResult;
use crate::logs::LogRetriever;
use crate::pagination::{PageIterator, PaginationOptions, MAX_PAGELEN};
use crate::types::{Pipeline, PipelineStep};
use tokio_util::sync::CancellationToken;

/// Service for pipeline operations.
///
/// Pipeline state changes while a build runs, so nothing here is cached.
pub struct PipelinesService<'a> {
    client: &'a BitbucketClient,
}

impl<'a> PipelinesService<'a> {
    /// Creates a new pipelines service.
    pub fn new(client: &'a BitbucketClient) -> Self {
        Self { client }
    }

    /// Iterates pipelines of a repository, newest first.
    pub fn iter(
        &self,
        workspace: &str,
        repo_slug: &str,
        options: PaginationOptions,
    ) -> ApiResult<PageIterator<'a, Pipeline>> {
        let path = format!("{}/pipelines/", repository_path(workspace, repo_slug)?);
        Ok(self
            .client
            .iterate(path, options.query("sort", "-created_on")))
    }

    /// Lists up to `limit` recent pipelines. A limit of 0 yields nothing.
    pub async fn list(
        &self,
        workspace: &str,
        repo_slug: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ApiResult<Vec<Pipeline>> {
        let path = format!("{}/pipelines/", repository_path(workspace, repo_slug)?);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let options = PaginationOptions::new()
            .pagelen(limit.clamp(1, MAX_PAGELEN as usize) as u32)
            .limit(limit)
            .query("sort", "-created_on");
        self.client
            .paginate(path, options)
            .fetch_all_typed(cancel)
            .await
    }

    /// Gets a pipeline by UUID or build number.
    pub async fn get(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<Pipeline> {
        let path = format!(
            "{}/pipelines/{}",
            repository_path(workspace, repo_slug)?,
            path_segment("pipeline id", pipeline_id)?
        );
        self.client
            .execute_json(&RequestDescriptor::get(path).without_cache(), cancel)
            .await
    }

    /// Lists every step of a pipeline.
    pub async fn list_steps(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<Vec<PipelineStep>> {
        let path = format!(
            "{}/pipelines/{}/steps/",
            repository_path(workspace, repo_slug)?,
            path_segment("pipeline id", pipeline_id)?
        );
        self.client
            .paginate(path, PaginationOptions::new().pagelen(MAX_PAGELEN))
            .fetch_all_typed(cancel)
            .await
    }

    /// Gets a single step.
    pub async fn get_step(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<PipelineStep> {
        let path = format!(
            "{}/pipelines/{}/steps/{}",
            repository_path(workspace, repo_slug)?,
            path_segment("pipeline id", pipeline_id)?,
            path_segment("step id", step_id)?
        );
        self.client
            .execute_json(&RequestDescriptor::get(path).without_cache(), cancel)
            .await
    }

    /// Gets the step log retriever.
    pub fn logs(&self) -> LogRetriever {
        self.client.logs()
    }
}
