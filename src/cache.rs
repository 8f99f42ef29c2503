//! TTL cache for selector search results.
//!
//! Keys hash the full request shape (query, platforms, k). Entries expire
//! by TTL and the cache evicts least-recently-accessed entries beyond its
//! capacity. Hit statistics feed the cache gauges.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Cache key for a selector search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Key over the full request shape.
    pub fn generate(query: &str, platforms: &[String], k: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(query.trim().to_lowercase().as_bytes());
        hasher.update(b"|");
        for platform in platforms {
            hasher.update(platform.to_lowercase().as_bytes());
            hasher.update(b",");
        }
        hasher.update(k.to_le_bytes());
        let hash = hasher.finalize();
        CacheKey(format!("{hash:x}"))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL + capacity bounded selector cache.
pub struct SelectorCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    stats: Arc<RwLock<CacheStats>>,
    ttl: Duration,
    max_entries: usize,
}

impl SelectorCache {
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            ttl: Duration::seconds(ttl_secs as i64),
            max_entries: max_entries.max(1),
        }
    }

    /// Configured TTL in seconds (for the gauge).
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Look up a key; expired entries are dropped on access.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        let mut entries = self.entries.write().await;
        let mut stats = self.stats.write().await;

        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                entry.hit_count += 1;
                entry.last_accessed = Utc::now();
                stats.hits += 1;
                Some(entry.payload.clone())
            }
            Some(_) => {
                entries.remove(key);
                stats.misses += 1;
                stats.entries = entries.len();
                None
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Insert a payload, evicting the least-recently-accessed entry when
    /// over capacity.
    pub async fn put(&self, key: CacheKey, payload: Value) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        let now = Utc::now();
        entries.insert(
            key,
            CacheEntry {
                payload,
                created_at: now,
                last_accessed: now,
                hit_count: 0,
            },
        );
        self.stats.write().await.entries = entries.len();
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = *self.stats.read().await;
        stats.entries = self.entries.read().await.len();
        stats
    }
}
