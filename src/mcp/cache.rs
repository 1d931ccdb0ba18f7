//! Result cache for read-only tool calls.
//!
//! Entries are keyed by service, tool and a digest of the canonicalized
//! arguments, live for a fixed TTL, and are evicted oldest-first once a
//! service reaches its entry bound. Entries are always inserted whole under
//! the lock; two concurrent misses for the same key may both compute the
//! result, and the later insert wins.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub enabled: bool,
    /// Seconds an entry stays valid
    pub ttl_secs: u64,
    /// Entry bound per service
    pub max_entries_per_service: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self { enabled: true, ttl_secs: 300, max_entries_per_service: 100 }
    }
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Render a JSON value with object keys sorted at every level.
///
/// `serde_json::Map` is ordered by key unless `preserve_order` is enabled,
/// which this crate does not do.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Identity of a cached call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service: String,
    pub tool: String,
    /// SHA-256 of the canonical arguments, hex encoded
    pub args_digest: String,
}

impl CacheKey {
    pub fn new(service: impl Into<String>, tool: impl Into<String>, args: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(args).as_bytes());
        Self {
            service: service.into(),
            tool: tool.into(),
            args_digest: format!("{:x}", hasher.finalize()),
        }
    }
}

/// A cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub hits: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Live entries
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when there were no lookups
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct ServiceCache {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Per-service result cache.
#[derive(Debug)]
pub struct ResultCache {
    policy: CachePolicy,
    services: Mutex<HashMap<String, ServiceCache>>,
}

impl ResultCache {
    /// Create a cache that reports stats for `services` even before use.
    pub fn new<I, S>(policy: CachePolicy, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services =
            services.into_iter().map(|s| (s.into(), ServiceCache::default())).collect();
        Self { policy, services: Mutex::new(services) }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.enabled && self.policy.max_entries_per_service > 0
    }

    /// Look up a live entry, counting the hit or miss.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Value> {
        let mut services = self.services.lock();
        let cache = services.entry(key.service.clone()).or_default();

        match cache.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits += 1;
                let value = entry.value.clone();
                cache.hits += 1;
                Some(value)
            }
            Some(_) => {
                cache.entries.remove(key);
                cache.misses += 1;
                None
            }
            None => {
                cache.misses += 1;
                None
            }
        }
    }

    /// Store a result, evicting the oldest entry if the service is full.
    pub fn insert(&self, key: CacheKey, value: Value) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&self, key: CacheKey, value: Value, now: Instant) {
        if !self.is_enabled() {
            return;
        }

        let mut services = self.services.lock();
        let cache = services.entry(key.service.clone()).or_default();

        cache.entries.retain(|_, e| !e.is_expired(now));
        if !cache.entries.contains_key(&key)
            && cache.entries.len() >= self.policy.max_entries_per_service
        {
            let oldest =
                cache.entries.values().min_by_key(|e| e.inserted_at).map(|e| e.key.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(service = %oldest.service, tool = %oldest.tool, "Evicting cache entry");
                cache.entries.remove(&oldest);
            }
        }

        let entry = CacheEntry {
            key: key.clone(),
            value,
            inserted_at: now,
            expires_at: now + self.policy.ttl(),
            hits: 0,
        };
        cache.entries.insert(key, entry);
    }

    /// Statistics for every known service. Does not touch the entries.
    pub fn stats(&self) -> BTreeMap<String, CacheStats> {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> BTreeMap<String, CacheStats> {
        self.services
            .lock()
            .iter()
            .map(|(name, cache)| {
                let lookups = cache.hits + cache.misses;
                let stats = CacheStats {
                    size: cache.entries.values().filter(|e| !e.is_expired(now)).count(),
                    hits: cache.hits,
                    misses: cache.misses,
                    hit_rate: if lookups == 0 { 0.0 } else { cache.hits as f64 / lookups as f64 },
                };
                (name.clone(), stats)
            })
            .collect()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for cache in self.services.lock().values_mut() {
            let before = cache.entries.len();
            cache.entries.retain(|_, e| !e.is_expired(now));
            removed += before - cache.entries.len();
        }
        removed
    }

    /// Drop every entry and reset counters; services stay known.
    pub fn clear(&self) {
        for cache in self.services.lock().values_mut() {
            *cache = ServiceCache::default();
        }
    }

    pub fn clear_service(&self, service: &str) {
        if let Some(cache) = self.services.lock().get_mut(service) {
            *cache = ServiceCache::default();
        }
    }
}
