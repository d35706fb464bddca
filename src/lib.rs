//! # Bitbucket Pipelines Integration Library
//!
//! A request engine for Bitbucket Cloud pipelines and SonarCloud analysis with:
//! - Retrying request execution with exponential backoff and jitter
//! - A response cache whose entry lifetimes follow build state
//! - Eager and lazy pagination over paged collections
//! - Step log retrieval with endpoint fallback, byte ranges and line streaming
//! - Cancellation of every network operation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_bitbucket::{BitbucketClient, CancellationToken};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BitbucketClient::builder()
//!         .bearer("repository-access-token")
//!         .build()?;
//!     let cancel = CancellationToken::new();
//!
//!     let pipelines = client.pipelines().list("workspace", "repo", 10, &cancel).await?;
//!     for pipeline in &pipelines {
//!         println!("#{} {:?}", pipeline.build_number, pipeline.state.build_state());
//!     }
//!
//!     if let Some(pipeline) = pipelines.first() {
//!         let steps = client
//!             .pipelines()
//!             .list_steps("workspace", "repo", &pipeline.uuid, &cancel)
//!             .await?;
//!         let mut session = client.logs().stream_step_logs(
//!             "workspace",
//!             "repo",
//!             &pipeline.uuid,
//!             &steps[0].uuid,
//!             &cancel,
//!         );
//!         while let Some(line) = session.recv().await {
//!             println!("{}", line?);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Authentication
pub mod auth;

// Request execution and caching
pub mod cache;
pub mod client;

// Collections and logs
pub mod logs;
pub mod pagination;

// API Services
pub mod services;

// Resilience patterns
pub mod resilience;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, CredentialProvider, EnvCredentialProvider, StaticCredentialProvider};
pub use cache::{CacheContext, CacheKey, CacheTtl, ResponseCache};
pub use client::{ApiResponse, ApiTarget, BitbucketClient, BitbucketClientBuilder, RequestDescriptor};
pub use config::{CacheConfig, ClientConfig, ClientConfigBuilder, RetryConfig};
pub use errors::{ApiError, ApiResult, ErrorKind};
pub use logs::{LogRetriever, LogStream, LogStreamSession};
pub use pagination::{PageDescriptor, PageIterator, PaginationOptions, Paginator};
pub use resilience::BackoffPolicy;
pub use tokio_util::sync::CancellationToken;
pub use types::*;
