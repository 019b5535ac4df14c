//! Retrieval Result Cache
//!
//! Per-fingerprint LRU with TTL and single-flight builds: concurrent misses
//! for the same key coalesce onto one in-flight build, and identical
//! requests within TTL return the cached value with no downstream calls.
//! Writes invalidate by key prefix; reads may be up to TTL stale.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{lock_poisoned, Result};

// ============================================================================
// TYPES
// ============================================================================

/// Where a cached response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Served from the cache
    Hit,
    /// Built by this request
    Miss,
    /// Waited on another request's in-flight build
    Coalesced,
}

impl CacheStatus {
    /// Stable name for the structured-result metrics block
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Coalesced => "coalesced",
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

type InflightReceiver = watch::Receiver<Option<serde_json::Value>>;

// ============================================================================
// CACHE
// ============================================================================

/// LRU + TTL cache with coalesced builds
pub struct RetrievalCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, InflightReceiver>>,
    default_ttl: Duration,
}

impl RetrievalCache {
    /// Cache holding at most `size` entries with the given default TTL
    pub fn new(size: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(size.max(1)).unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Fetch a fresh entry without building
    pub fn peek(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        match entries.get(key) {
            Some(entry) if entry.is_fresh() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Get the cached value, or build it with single-flight coalescing
    ///
    /// `ttl` overrides the default when set (per-layer TTL overrides).
    pub async fn get_or_build<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        build: F,
    ) -> Result<(serde_json::Value, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value>>,
    {
        if let Some(value) = self.peek(key)? {
            return Ok((value, CacheStatus::Hit));
        }

        // Join an in-flight build when one exists; otherwise register ours.
        enum Role {
            Builder(watch::Sender<Option<serde_json::Value>>),
            Waiter(InflightReceiver),
        }
        let role = {
            let mut inflight = self.inflight.lock().map_err(lock_poisoned)?;
            let existing = inflight.get(key).cloned();
            match existing {
                Some(rx) => Role::Waiter(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Role::Builder(tx)
                }
            }
        };

        match role {
            Role::Builder(tx) => self.build_and_publish(key, ttl, build, tx).await,
            Role::Waiter(mut rx) => {
                // Coalesce: wait for the builder to publish. A dropped sender
                // (builder failed) falls through to a fresh local build.
                let _ = rx.changed().await;
                let published = rx.borrow().clone();
                match published {
                    Some(value) => Ok((value, CacheStatus::Coalesced)),
                    None => {
                        let value = build().await?;
                        self.store(key, value.clone(), ttl)?;
                        Ok((value, CacheStatus::Miss))
                    }
                }
            }
        }
    }

    async fn build_and_publish<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        build: F,
        tx: watch::Sender<Option<serde_json::Value>>,
    ) -> Result<(serde_json::Value, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<serde_json::Value>>,
    {
        let result = build().await;
        // Always unregister before publishing so late subscribers re-check
        // the cache instead of waiting forever.
        {
            let mut inflight = self.inflight.lock().map_err(lock_poisoned)?;
            inflight.remove(key);
        }
        match result {
            Ok(value) => {
                self.store(key, value.clone(), ttl)?;
                let _ = tx.send(Some(value.clone()));
                Ok((value, CacheStatus::Miss))
            }
            Err(e) => {
                drop(tx);
                Err(e)
            }
        }
    }

    fn store(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        entries.put(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
        Ok(())
    }

    /// Drop every entry whose key starts with the prefix
    pub fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.lock().map_err(lock_poisoned)?;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len())
    }

    /// Entry count (test hook)
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
