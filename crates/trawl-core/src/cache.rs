//! Bounded response cache with per-entry expiry and negative entries.
//!
//! A negative entry records "the source confirmed it has no such record" so
//! paginated search APIs that return no match are not asked again until the
//! entry expires. Entries past their TTL read as absent; once the size bound
//! is exceeded the least-recently-used entry is evicted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use moka::policy::EvictionPolicy;

use crate::config::CacheConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CachedValue {
    Found { body: String, final_url: String },
    Negative,
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    ttl: Duration,
}

impl CacheEntry {
    fn weight(&self, key: &str) -> u32 {
        let body = match &self.value {
            CachedValue::Found { body, final_url } => body.len() + final_url.len(),
            CachedValue::Negative => 0,
        };
        u32::try_from(key.len() + body).unwrap_or(u32::MAX).max(1)
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit { body: String, final_url: String },
    /// Confirmed absent at the source.
    Negative,
    /// Never looked up, expired or evicted.
    Absent,
}

struct PerEntryTtl;

impl Expiry<String, Arc<CacheEntry>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-wide response cache keyed by normalized request identity.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<String, Arc<CacheEntry>>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let builder = Cache::builder()
            .expire_after(PerEntryTtl)
            .eviction_policy(EvictionPolicy::lru());
        let builder = match config.max_bytes {
            Some(max_bytes) => builder
                .max_capacity(max_bytes)
                .weigher(|key: &String, entry: &Arc<CacheEntry>| entry.weight(key)),
            None => builder.max_capacity(config.max_entries),
        };
        Self {
            inner: builder.build(),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get(&self, key: &str) -> CacheLookup {
        match self.inner.get(key).await {
            Some(entry) => match &entry.value {
                CachedValue::Found { body, final_url } => CacheLookup::Hit {
                    body: body.clone(),
                    final_url: final_url.clone(),
                },
                CachedValue::Negative => CacheLookup::Negative,
            },
            None => CacheLookup::Absent,
        }
    }

    pub async fn set(&self, key: &str, body: String, final_url: String, ttl: Duration) {
        let entry = CacheEntry {
            value: CachedValue::Found { body, final_url },
            ttl,
        };
        self.inner.insert(key.to_string(), Arc::new(entry)).await;
    }

    pub async fn set_negative(&self, key: &str, ttl: Duration) {
        let entry = CacheEntry {
            value: CachedValue::Negative,
            ttl,
        };
        self.inner.insert(key.to_string(), Arc::new(entry)).await;
    }

    pub async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Approximate number of live entries (exact after `run_pending_tasks`).
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Applies pending evictions and expirations.
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}
