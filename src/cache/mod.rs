//! Response cache for GET requests.
//!
//! Entries are keyed by a SHA-256 digest of the resource, its sorted query
//! parameters and the domain context the response was fetched under. Each
//! entry carries its own TTL, chosen by the caller from domain state.

use crate::config::CacheConfig;
use crate::types::BuildState;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Domain context folded into a cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CacheContext {
    /// The response belongs to a pull request analysis.
    pub pull_request_analysis: bool,
    /// Pull request the response belongs to.
    pub pull_request_id: Option<u64>,
}

impl CacheContext {
    /// Context for an analysis of the given pull request.
    pub fn pull_request(id: u64) -> Self {
        Self {
            pull_request_analysis: true,
            pull_request_id: Some(id),
        }
    }
}

/// Deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds a key from a resource, its query parameters and context.
    ///
    /// Parameter order does not affect the key.
    pub fn new<'a, I>(resource: &str, params: I, context: &CacheContext) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let sorted: BTreeMap<&str, Vec<&str>> =
            params.into_iter().fold(BTreeMap::new(), |mut map, (k, v)| {
                map.entry(k).or_default().push(v);
                map
            });

        let mut hasher = Sha256::new();
        hasher.update(resource.as_bytes());
        hasher.update([0u8]);
        for (name, mut values) in sorted {
            values.sort_unstable();
            for value in values {
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
                hasher.update([0u8]);
            }
        }
        hasher.update([u8::from(context.pull_request_analysis)]);
        match context.pull_request_id {
            Some(id) => {
                hasher.update(b"pr:");
                hasher.update(id.to_be_bytes());
            }
            None => hasher.update(b"pr:-"),
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Builds a key for a resource without query parameters.
    pub fn for_resource(resource: &str, context: &CacheContext) -> Self {
        Self::new(resource, std::iter::empty::<(&str, &str)>(), context)
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// TTLs derived from build state.
pub struct CacheTtl;

impl CacheTtl {
    /// Lifetime for results of a finished build.
    pub const COMPLETED: Duration = Duration::from_secs(24 * 60 * 60);
    /// Lifetime for results of a build still running.
    pub const RUNNING: Duration = Duration::from_secs(5 * 60);
    /// Lifetime when the state is unknown.
    pub const DEFAULT: Duration = Duration::from_secs(60 * 60);

    /// Chooses a TTL for data tied to a build in the given state.
    pub fn for_build_state(state: Option<BuildState>) -> Duration {
        match state {
            Some(s) if s.is_completed() => Self::COMPLETED,
            Some(s) if s.is_running() => Self::RUNNING,
            _ => Self::DEFAULT,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Bytes,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

type Entries = Arc<RwLock<HashMap<CacheKey, CacheEntry>>>;

/// Thread-safe response cache.
///
/// Readers share a read lock. An expired entry is reported as a miss at once
/// and removed by a separately scheduled eviction, or by the next `set`.
#[derive(Debug)]
pub struct ResponseCache {
    enabled: bool,
    default_ttl: Duration,
    entries: Entries,
}

impl ResponseCache {
    /// Creates a cache.
    pub fn new(enabled: bool, default_ttl: Duration) -> Self {
        Self {
            enabled,
            default_ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a cache from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.enabled, config.default_ttl)
    }

    /// Creates a cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO)
    }

    /// Returns true if the cache stores entries.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// TTL used when the caller gives none.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Looks up a live entry.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }

        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.payload.clone()),
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.schedule_eviction(key.clone());
        }
        None
    }

    /// Stores a payload for `ttl`.
    pub fn set(&self, key: CacheKey, payload: Bytes, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }

        let now = Instant::now();
        let entry = CacheEntry {
            payload,
            expires_at: now + ttl,
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, existing| !existing.is_expired(now));
        entries.insert(key, entry);
    }

    /// Stores a payload under the default TTL.
    pub fn set_default(&self, key: CacheKey, payload: Bytes) {
        self.set(key, payload, self.default_ttl);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of stored entries, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_eviction(&self, key: CacheKey) {
        let entries = Arc::clone(&self.entries);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let mut guard = entries.write().unwrap_or_else(|e| e.into_inner());
                    evict_if_expired(&mut guard, &key);
                });
            }
            Err(_) => {
                // Outside a runtime: evict only if the lock is free right now.
                if let Ok(mut guard) = entries.try_write() {
                    evict_if_expired(&mut guard, &key);
                }
            }
        }
    }
}

fn evict_if_expired(entries: &mut HashMap<CacheKey, CacheEntry>, key: &CacheKey) {
    // A concurrent set may have refreshed the entry since the read.
    if entries
        .get(key)
        .map_or(false, |entry| entry.is_expired(Instant::now()))
    {
        entries.remove(key);
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
