//! Bitbucket and SonarCloud service implementations.

mod analysis;
mod pipelines;
mod pull_requests;

pub use analysis::*;
pub use pipelines::*;
pub use pull_requests::*;

use crate::errors::{ApiError, ApiResult, ErrorKind};

/// Characters that would end or re-encode a path segment.
const RESERVED_SEGMENT_CHARS: &[char] = &['/', '\\', '?', '#', '%'];

/// Validates a caller-supplied URL path segment.
///
/// Dot segments are refused as well, since URL parsing would collapse them.
pub(crate) fn path_segment<'a>(name: &str, value: &'a str) -> ApiResult<&'a str> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(RESERVED_SEGMENT_CHARS)
    {
        return Err(ApiError::new(
            ErrorKind::Validation,
            format!("Invalid {}: {:?}", name, value),
        ));
    }
    Ok(value)
}

pub(crate) fn repository_path(workspace: &str, repo_slug: &str) -> ApiResult<String> {
    Ok(format!(
        "/repositories/{}/{}",
        path_segment("workspace", workspace)?,
        path_segment("repository", repo_slug)?
    ))
}
