//! Pagination handling for Bitbucket collections.
//!
//! Bitbucket returns collections as an envelope
//! `{size, page, pagelen, next, previous, values}` where `next` is an absolute
//! URL. The envelope is decoded first with `values` kept raw; items are decoded
//! into the caller's type on demand.

use crate::client::{ApiTarget, BitbucketClient, RequestDescriptor};
use crate::errors::{ApiError, ApiResult};
use futures::stream::{self, Stream};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default items per page.
pub const DEFAULT_PAGELEN: u32 = 50;

/// Maximum items per page accepted by Bitbucket.
pub const MAX_PAGELEN: u32 = 100;

/// One server-returned batch of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Items in this page, as reported by the server.
    #[serde(default)]
    pub size: usize,
    /// 1-based page ordinal.
    #[serde(default)]
    pub page: u32,
    /// Requested page length.
    #[serde(default)]
    pub pagelen: u32,
    /// Absolute URL of the next page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Absolute URL of the previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    /// Undecoded items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Box<RawValue>>,
}

impl PageDescriptor {
    /// Returns true if the server advertised another page.
    pub fn has_next(&self) -> bool {
        self.next_url().is_some()
    }

    /// Next page URL, ignoring empty strings.
    pub fn next_url(&self) -> Option<&str> {
        self.next.as_deref().filter(|n| !n.is_empty())
    }

    /// Decodes the items into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> ApiResult<Vec<T>> {
        match self.values {
            Some(ref raw) => serde_json::from_str(raw.get()).map_err(|e| {
                ApiError::decode(format!("Failed to decode page {} values: {}", self.page, e))
                    .with_cause(e)
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Number of items actually carried in `values`.
    pub fn item_count(&self) -> ApiResult<usize> {
        Ok(self.decode::<IgnoredAny>()?.len())
    }
}

/// Options for walking a collection.
#[derive(Debug, Clone)]
pub struct PaginationOptions {
    /// First page to request.
    pub page: u32,
    /// Items per page.
    pub pagelen: u32,
    /// Stop after this many items; `None` or zero means no ceiling.
    pub limit: Option<usize>,
    /// Extra query parameters for the first page.
    pub query: Vec<(String, String)>,
    /// API the collection lives on.
    pub target: ApiTarget,
    /// Cache pages for this long; pages bypass the cache when `None`.
    pub cache_ttl: Option<Duration>,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            page: 1,
            pagelen: DEFAULT_PAGELEN,
            limit: None,
            query: Vec::new(),
            target: ApiTarget::Pipelines,
            cache_ttl: None,
        }
    }
}

impl PaginationOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the starting page.
    pub fn page(mut self, page: u32) -> Self {
        self.page = page.max(1);
        self
    }

    /// Sets items per page.
    pub fn pagelen(mut self, pagelen: u32) -> Self {
        self.pagelen = pagelen.clamp(1, MAX_PAGELEN);
        self
    }

    /// Sets the item ceiling.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Adds a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets the target API.
    pub fn target(mut self, target: ApiTarget) -> Self {
        self.target = target;
        self
    }

    /// Caches fetched pages.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    fn ceiling(&self) -> Option<usize> {
        self.limit.filter(|l| *l > 0)
    }
}

/// Stateful walker over a page sequence.
///
/// Holds mutable cursor state; use one paginator per collection and per task.
pub struct Paginator<'a> {
    client: &'a BitbucketClient,
    endpoint: String,
    options: PaginationOptions,
    current: Option<PageDescriptor>,
    fetched: usize,
}

impl<'a> Paginator<'a> {
    /// Creates a paginator.
    pub fn new(
        client: &'a BitbucketClient,
        endpoint: impl Into<String>,
        options: PaginationOptions,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            options,
            current: None,
            fetched: 0,
        }
    }

    /// Items fetched so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Last page fetched.
    pub fn current_page(&self) -> Option<&PageDescriptor> {
        self.current.as_ref()
    }

    /// Configured item ceiling.
    pub fn limit(&self) -> Option<usize> {
        self.options.ceiling()
    }

    fn limit_reached(&self) -> bool {
        self.limit().map_or(false, |limit| self.fetched >= limit)
    }

    /// Returns true if another fetch may yield a page.
    ///
    /// Always true before the first fetch.
    pub fn has_next_page(&self) -> bool {
        match self.current {
            None => true,
            Some(ref page) => !self.limit_reached() && page.has_next(),
        }
    }

    /// Rewinds to the starting page and zeroes the counter.
    pub fn reset(&mut self) {
        self.current = None;
        self.fetched = 0;
    }

    /// Fetches the next page, or `None` once the collection or ceiling is exhausted.
    pub async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> ApiResult<Option<PageDescriptor>> {
        if self.limit_reached() {
            return Ok(None);
        }

        let descriptor = match self.current {
            None => self.first_page_request(),
            Some(ref page) => match page.next_url() {
                Some(next) => RequestDescriptor::get(next).with_target(self.options.target),
                None => return Ok(None),
            },
        };
        let descriptor = match self.options.cache_ttl {
            Some(ttl) => descriptor.with_cache_ttl(ttl),
            None => descriptor.without_cache(),
        };

        let page: PageDescriptor = self.client.execute_json(&descriptor, cancel).await?;
        self.fetched += page.item_count()?;
        self.current = Some(page.clone());
        Ok(Some(page))
    }

    fn first_page_request(&self) -> RequestDescriptor {
        let mut descriptor =
            RequestDescriptor::get(self.endpoint.as_str()).with_target(self.options.target);
        for (name, value) in &self.options.query {
            descriptor = descriptor.with_query(name.as_str(), value.as_str());
        }
        descriptor
            .with_query("page", self.options.page.to_string())
            .with_query("pagelen", self.options.pagelen.to_string())
    }

    /// Drains the remaining pages into JSON values.
    pub async fn fetch_all(&mut self, cancel: &CancellationToken) -> ApiResult<Vec<serde_json::Value>> {
        self.fetch_all_typed(cancel).await
    }

    /// Drains the remaining pages, decoding every item into `T`.
    ///
    /// The last batch is trimmed to the ceiling. Any error discards what was
    /// collected.
    pub async fn fetch_all_typed<T: DeserializeOwned>(
        &mut self,
        cancel: &CancellationToken,
    ) -> ApiResult<Vec<T>> {
        let mut items = Vec::new();

        while let Some(page) = self.next_page(cancel).await? {
            let mut batch: Vec<T> = page.decode()?;
            if let Some(limit) = self.limit() {
                batch.truncate(limit.saturating_sub(items.len()));
            }
            items.extend(batch);
        }

        Ok(items)
    }
}

/// Lazy, item-at-a-time view over a paginator.
///
/// Never fetches more than one page ahead. Has no reset of its own: build a
/// new one over a reset paginator instead.
pub struct PageIterator<'a, T> {
    paginator: Paginator<'a>,
    buffer: VecDeque<T>,
    yielded: usize,
    finished: bool,
}

impl<'a, T: DeserializeOwned> PageIterator<'a, T> {
    /// Creates an iterator over a paginator.
    pub fn new(paginator: Paginator<'a>) -> Self {
        Self {
            paginator,
            buffer: VecDeque::new(),
            yielded: 0,
            finished: false,
        }
    }

    fn limit_reached(&self) -> bool {
        self.paginator
            .limit()
            .map_or(false, |limit| self.yielded >= limit)
    }

    /// Returns true if `next` may yield another item.
    pub fn has_next(&self) -> bool {
        if self.limit_reached() {
            return false;
        }
        !self.buffer.is_empty() || (!self.finished && self.paginator.has_next_page())
    }

    /// Gives back the underlying paginator, dropping any buffered items.
    ///
    /// To start over, reset it and build a new iterator.
    pub fn into_paginator(self) -> Paginator<'a> {
        self.paginator
    }

    /// Yields the next item, fetching a page only when the buffer is empty.
    pub async fn next(&mut self, cancel: &CancellationToken) -> ApiResult<Option<T>> {
        loop {
            if self.limit_reached() {
                self.finished = true;
                self.buffer.clear();
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                self.yielded += 1;
                return Ok(Some(item));
            }
            if self.finished {
                return Ok(None);
            }

            match self.paginator.next_page(cancel).await? {
                Some(page) => self.buffer = page.decode::<T>()?.into(),
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }

    /// Adapts the iterator into a stream bound to `cancel`.
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = ApiResult<T>> + 'a
    where
        T: 'a,
    {
        stream::try_unfold((self, cancel), |(mut iter, cancel)| async move {
            let item = iter.next(&cancel).await?;
            Ok::<_, ApiError>(item.map(|item| (item, (iter, cancel))))
        })
    }
}
