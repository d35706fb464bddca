//! Pipeline step log retrieval.
//!
//! Logs are served from more than one endpoint shape depending on the
//! pipeline's age and runner. [`LogRetriever`] walks a fixed fallback chain:
//!
//! 1. `.../pipelines/{pipeline}/steps/{step}/log`
//! 2. `.../pipelines/{pipeline}/steps/{step}/logs`
//! 3. the step listing, following the step's `links.log.href` as an absolute URL
//!
//! If every endpoint fails, the returned error lists each attempt and its cause.

use crate::client::{BitbucketClient, ByteRange, RequestDescriptor};
use crate::errors::{ApiError, ApiResult, ErrorKind};
use crate::observability::TracingHooks;
use crate::pagination::{PaginationOptions, MAX_PAGELEN};
use crate::services::path_segment;
use crate::types::PipelineStep;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Response;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lines buffered between the streaming task and its consumer.
pub const LINE_BUFFER: usize = 256;

const LOG_ACCEPT: &str = "text/plain, application/octet-stream, */*";

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// An open step log body.
pub struct LogStream {
    status: u16,
    source: String,
    content_length: Option<u64>,
    reader: StreamReader<ByteStream, Bytes>,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("status", &self.status)
            .field("source", &self.source)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl LogStream {
    fn from_response(response: Response, source: String) -> Self {
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        Self::from_stream(Box::pin(body), status, source, content_length)
    }

    fn from_stream(
        stream: ByteStream,
        status: u16,
        source: String,
        content_length: Option<u64>,
    ) -> Self {
        Self {
            status,
            source,
            content_length,
            reader: StreamReader::new(stream),
        }
    }

    /// HTTP status the log was served with (200, or 206 for partial content).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns true if the server honoured a byte range.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Endpoint that served the log.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Advertised body length.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Reads the next line without its terminator. Invalid UTF-8 is replaced.
    pub async fn next_line(&mut self) -> ApiResult<Option<String>> {
        let mut buf = Vec::new();
        let read = self
            .reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(read_error)?;
        if read == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Buffers the remaining body.
    pub async fn read_to_end(mut self) -> ApiResult<Bytes> {
        let mut buf = Vec::new();
        self.reader
            .read_to_end(&mut buf)
            .await
            .map_err(read_error)?;
        Ok(Bytes::from(buf))
    }
}

fn read_error(e: io::Error) -> ApiError {
    ApiError::network("Failed to read log stream")
        .with_detail(e.to_string())
        .with_cause(e)
}

/// Retrieves pipeline step logs.
#[derive(Debug, Clone)]
pub struct LogRetriever {
    client: BitbucketClient,
}

impl LogRetriever {
    /// Creates a retriever.
    pub fn new(client: BitbucketClient) -> Self {
        Self { client }
    }

    /// Opens a step log, falling back across endpoint shapes.
    pub async fn get_step_logs(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<LogStream> {
        self.open(workspace, repo_slug, pipeline_id, step_id, None, cancel)
            .await
    }

    /// Opens a byte range of a step log. `end` is inclusive; `None` reads to
    /// the end. Servers may ignore the range and answer 200 with the full log.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_step_logs_with_range(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        step_id: &str,
        start: u64,
        end: Option<u64>,
        cancel: &CancellationToken,
    ) -> ApiResult<LogStream> {
        if matches!(end, Some(end) if end < start) {
            return Err(ApiError::new(
                ErrorKind::Validation,
                format!("Invalid byte range {}-{:?}", start, end),
            ));
        }

        let range = ByteRange { start, end };
        self.open(workspace, repo_slug, pipeline_id, step_id, Some(range), cancel)
            .await
    }

    /// Reads a whole step log into a string.
    pub async fn get_step_logs_text(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<String> {
        let stream = self
            .get_step_logs(workspace, repo_slug, pipeline_id, step_id, cancel)
            .await?;

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::cancelled("Log read cancelled")),
            body = stream.read_to_end() => body?,
        };
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Streams a step log line by line from a background task.
    ///
    /// The session's token is a child of `cancel`; cancelling either stops the
    /// task. Must be called from within a tokio runtime.
    pub fn stream_step_logs(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> LogStreamSession {
        let id = Uuid::new_v4();
        let token = cancel.child_token();
        let (lines_tx, lines_rx) = mpsc::channel(LINE_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let retriever = self.clone();
        let request = StepRef {
            workspace: workspace.to_string(),
            repo_slug: repo_slug.to_string(),
            pipeline_id: pipeline_id.to_string(),
            step_id: step_id.to_string(),
        };
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            retriever
                .pump(id, request, lines_tx, errors_tx, task_token)
                .await;
        });

        LogStreamSession {
            id,
            lines: lines_rx,
            errors: errors_rx,
            cancel: token,
            task: Some(task),
            finished: false,
        }
    }

    async fn pump(
        &self,
        id: Uuid,
        step: StepRef,
        lines: mpsc::Sender<String>,
        errors: mpsc::Sender<ApiError>,
        cancel: CancellationToken,
    ) {
        let mut sent = 0u64;
        let outcome = match self
            .get_step_logs(
                &step.workspace,
                &step.repo_slug,
                &step.pipeline_id,
                &step.step_id,
                &cancel,
            )
            .await
        {
            Ok(mut stream) => {
                let result = forward_lines(&mut stream, &lines, &cancel, &mut sent).await;
                drop(stream);
                result
            }
            Err(e) => Err(e),
        };

        let label = match outcome {
            Ok(()) => "completed".to_string(),
            Err(ref e) => e.kind().to_string(),
        };
        self.client
            .hooks()
            .on_stream_closed(&id.to_string(), sent, &label);

        if let Err(e) = outcome {
            // Capacity is one and this is the only send.
            let _ = errors.try_send(e);
        }
    }

    async fn open(
        &self,
        workspace: &str,
        repo_slug: &str,
        pipeline_id: &str,
        step_id: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> ApiResult<LogStream> {
        let step_path = step_path(workspace, repo_slug, pipeline_id, step_id)?;
        let mut failures = FallbackFailures::new(self.client.hooks());

        for suffix in ["log", "logs"] {
            let path = format!("{}/{}", step_path, suffix);
            match self.try_open(RequestDescriptor::get(path.as_str()), range, cancel).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => failures.record(format!("GET {}", path), e),
            }
        }

        let listing = steps_path(workspace, repo_slug, pipeline_id)?;
        match self.find_log_link(&listing, step_id, cancel).await {
            Ok(Some(href)) => {
                match self
                    .try_open(RequestDescriptor::get(href.as_str()), range, cancel)
                    .await
                {
                    Ok(stream) => return Ok(stream),
                    Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                    Err(e) => failures.record(format!("GET {} (step log link)", href), e),
                }
            }
            Ok(None) => failures.record(
                format!("GET {} (step metadata)", listing),
                ApiError::not_found(format!("Step {} has no log link", step_id)),
            ),
            Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
            Err(e) => failures.record(format!("GET {} (step metadata)", listing), e),
        }

        Err(failures.into_error(step_id))
    }

    async fn try_open(
        &self,
        descriptor: RequestDescriptor,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> ApiResult<LogStream> {
        let mut descriptor = descriptor.with_accept(LOG_ACCEPT);
        if let Some(range) = range {
            descriptor = descriptor.with_range(range.start, range.end);
        }

        let source = self.client.resolve_url(&descriptor)?.to_string();
        let response = self.client.execute_streaming(&descriptor, cancel).await?;
        let status = response.status().as_u16();
        if range.is_some() && status != 200 && status != 206 {
            return Err(ApiError::new(
                ErrorKind::Unknown,
                format!("Unexpected status {} for ranged log request", status),
            )
            .with_status(status));
        }

        Ok(LogStream::from_response(response, source))
    }

    async fn find_log_link(
        &self,
        listing: &str,
        step_id: &str,
        cancel: &CancellationToken,
    ) -> ApiResult<Option<String>> {
        let steps: Vec<PipelineStep> = self
            .client
            .paginate(listing, PaginationOptions::new().pagelen(MAX_PAGELEN))
            .fetch_all_typed(cancel)
            .await?;

        let wanted = bare_uuid(step_id);
        let step = steps
            .iter()
            .find(|step| bare_uuid(&step.uuid) == wanted)
            .ok_or_else(|| {
                ApiError::not_found(format!("Step {} not found in pipeline", step_id))
            })?;
        Ok(step.log_href().map(str::to_string))
    }
}

async fn forward_lines(
    stream: &mut LogStream,
    lines: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    sent: &mut u64,
) -> ApiResult<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            line = stream.next_line() => Some(line),
        };
        let line = match next {
            None => return Err(ApiError::cancelled("Log stream cancelled")),
            Some(line) => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
        };

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = lines.send(line) => Some(result.is_ok()),
        };
        match delivered {
            None => return Err(ApiError::cancelled("Log stream cancelled")),
            // Consumer hung up.
            Some(false) => return Ok(()),
            Some(true) => *sent += 1,
        }
    }
}

struct StepRef {
    workspace: String,
    repo_slug: String,
    pipeline_id: String,
    step_id: String,
}

/// Ordered failures of the fallback chain.
struct FallbackFailures {
    hooks: TracingHooks,
    attempts: Vec<(String, ApiError)>,
}

impl FallbackFailures {
    fn new(hooks: TracingHooks) -> Self {
        Self {
            hooks,
            attempts: Vec::new(),
        }
    }

    fn record(&mut self, attempt: String, error: ApiError) {
        self.hooks.on_log_fallback(&attempt, &error.to_string());
        self.attempts.push((attempt, error));
    }

    fn into_error(self, step_id: &str) -> ApiError {
        let kind = self
            .attempts
            .first()
            .map_or(ErrorKind::Unknown, |(_, e)| e.kind());
        let status = self.attempts.first().and_then(|(_, e)| e.status_code());

        let listing = self
            .attempts
            .iter()
            .enumerate()
            .map(|(i, (attempt, error))| format!("[{}] {}: {}", i + 1, attempt, error))
            .collect::<Vec<_>>()
            .join("; ");
        let mut error = ApiError::new(
            kind,
            format!(
                "Failed to retrieve logs for step {} after {} attempts: {}",
                step_id,
                self.attempts.len(),
                listing
            ),
        );
        if let Some(status) = status {
            error = error.with_status(status);
        }
        match self.attempts.into_iter().next() {
            Some((_, first)) => error.with_cause(first),
            None => error,
        }
    }
}

/// Handle to a background log streaming task.
///
/// Dropping the session cancels the task.
pub struct LogStreamSession {
    id: Uuid,
    lines: mpsc::Receiver<String>,
    errors: mpsc::Receiver<ApiError>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

impl std::fmt::Debug for LogStreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamSession")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl LogStreamSession {
    /// Session id, as it appears in log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receives the next line.
    ///
    /// Returns `Some(Err(_))` once for a failure or cancellation, then `None`.
    /// Returns `None` after the log has been fully read.
    pub async fn recv(&mut self) -> Option<ApiResult<String>> {
        if self.finished {
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(Err(ApiError::cancelled("Log stream cancelled"))),
            line = self.lines.recv() => match line {
                Some(line) => Some(Ok(line)),
                None => self.errors.recv().await.map(Err),
            },
        };

        if !matches!(next, Some(Ok(_))) {
            self.finished = true;
        }
        next
    }

    /// Stops the background task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the background task to exit.
    pub async fn join(mut self) -> ApiResult<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                ApiError::new(ErrorKind::Unknown, "Log stream task failed").with_cause(e)
            }),
            None => Ok(()),
        }
    }
}

impl Drop for LogStreamSession {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

fn steps_path(workspace: &str, repo_slug: &str, pipeline_id: &str) -> ApiResult<String> {
    Ok(format!(
        "/repositories/{}/{}/pipelines/{}/steps/",
        path_segment("workspace", workspace)?,
        path_segment("repository", repo_slug)?,
        path_segment("pipeline id", pipeline_id)?
    ))
}

fn step_path(
    workspace: &str,
    repo_slug: &str,
    pipeline_id: &str,
    step_id: &str,
) -> ApiResult<String> {
    Ok(format!(
        "{}{}",
        steps_path(workspace, repo_slug, pipeline_id)?,
        path_segment("step id", step_id)?
    ))
}

fn bare_uuid(id: &str) -> &str {
    id.trim_start_matches('{').trim_end_matches('}')
}
