use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use ckit_core::sampling::{SamplingClient, SamplingError, SamplingRequest, SamplingResponse};

/// Stable SHA-256 fingerprint of a value's JSON form.
///
/// `serde_json` object keys are sorted, so structurally equal values hash
/// identically regardless of construction order.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Concurrent map with per-entry expiry. Each key's get/insert is atomic.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Option<Duration>,
}

impl<V: Clone> TtlCache<V> {
    /// `default_ttl = None` keeps entries until removed.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                created_at: now,
                expires_at: ttl.map(|t| now + t),
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Memoizes sampling responses by request fingerprint.
///
/// Concurrent misses for the same request may each reach the inner client;
/// the last response written wins.
pub struct MemoizedSampler<S: SamplingClient> {
    inner: S,
    cache: TtlCache<SamplingResponse>,
    hits: AtomicU64,
}

impl<S: SamplingClient> MemoizedSampler<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(Some(ttl)),
            hits: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &TtlCache<SamplingResponse> {
        &self.cache
    }
}

#[async_trait]
impl<S: SamplingClient> SamplingClient for MemoizedSampler<S> {
    async fn create_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<SamplingResponse, SamplingError> {
        let key = fingerprint(request);
        if let Some(hit) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %key, "sampling cache hit");
            return Ok(hit);
        }
        let response = self.inner.create_message(request).await?;
        self.cache.insert(key, response.clone());
        Ok(response)
    }
}
