//! Cache generations and the store abstraction behind them.
//!
//! A store holds any number of named generations; each generation maps a
//! [`CacheKey`] to a [`CacheEntry`]. The worker only ever reads and writes the
//! generation named by its version tag.

use std::fmt;

use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use swcache_net::{Request, Response, ResponseType};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::error::StoreError;

// ==================== Keys & Entries ====================

/// Request key: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.as_str().to_string(),
            url: request.url.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request key.
    pub key: CacheKey,

    /// Final response URL (after redirects).
    pub response_url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    #[serde(default)]
    pub response_type: ResponseType,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage.
    pub fn from_response(key: CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            key,
            response_url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            response_type: response.response_type,
            cached_at: u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default(),
        }
    }

    /// Rebuild the stored response.
    pub fn to_response(&self) -> Result<Response, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: self.key.to_string(),
            reason,
        };

        let url = Url::parse(&self.response_url).map_err(|e| corrupt(e.to_string()))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| corrupt(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| corrupt(e.to_string()))?;
            let value = HeaderValue::from_str(value).map_err(|e| corrupt(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response::new(
            url,
            status,
            headers,
            self.body.clone(),
            self.response_type,
        ))
    }

    /// Bytes counted against a store quota.
    pub fn size(&self) -> u64 {
        let header_bytes: usize = self.headers.iter().map(|(n, v)| n.len() + v.len()).sum();
        (self.body.len() + header_bytes + self.key.url.len()) as u64
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Store Interface ====================

/// Storage backend for cache generations.
///
/// Reads of a missing generation behave as empty; writes create it.
pub trait CacheStore: Send + Sync {
    /// Open a generation, creating it if absent.
    fn open<'a>(&'a self, generation: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Look up one entry.
    fn get<'a>(
        &'a self,
        generation: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, StoreError>>;

    /// Insert or overwrite one entry.
    fn put<'a>(
        &'a self,
        generation: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Insert a batch. Either every entry is written or none is.
    fn put_all<'a>(
        &'a self,
        generation: &'a str,
        entries: Vec<CacheEntry>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Remove one entry. Returns whether it existed.
    fn delete<'a>(
        &'a self,
        generation: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// All keys of a generation, sorted.
    fn keys<'a>(&'a self, generation: &'a str) -> BoxFuture<'a, Result<Vec<CacheKey>, StoreError>>;

    /// All generation names, sorted.
    fn generations(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;

    /// Remove a whole generation. Returns whether it existed.
    fn delete_generation<'a>(&'a self, generation: &'a str)
        -> BoxFuture<'a, Result<bool, StoreError>>;
}

// ==================== Cache ====================

/// One generation held in memory.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Add entry. Returns the entry it replaced.
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key.clone(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Bytes held by this cache.
    pub fn size(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

// ==================== Cache Storage ====================

/// All generations held in memory.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bytes held across all caches.
    pub fn size(&self) -> u64 {
        self.caches.values().map(Cache::size).sum()
    }

    /// Size after replacing `entries` in `generation`.
    fn size_after(&self, generation: &str, entries: &[CacheEntry]) -> u64 {
        let replaced: u64 = self
            .get(generation)
            .map(|cache| {
                entries
                    .iter()
                    .filter_map(|e| cache.match_request(&e.key))
                    .map(CacheEntry::size)
                    .sum()
            })
            .unwrap_or(0);
        let added: u64 = entries.iter().map(CacheEntry::size).sum();
        self.size().saturating_sub(replaced) + added
    }
}

/// Collapse entries sharing a key. The last one wins, in the first one's position.
pub fn dedup_by_key(entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
    let mut index: HashMap<CacheKey, usize> = HashMap::with_capacity(entries.len());
    let mut unique: Vec<CacheEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match index.get(&entry.key) {
            Some(&i) => unique[i] = entry,
            None => {
                index.insert(entry.key.clone(), unique.len());
                unique.push(entry);
            }
        }
    }
    unique
}

// ==================== Memory Store ====================

/// In-memory [`CacheStore`] with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    storage: RwLock<CacheStorage>,
    quota_bytes: Option<u64>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that refuses writes growing it past `quota_bytes`.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            storage: RwLock::new(CacheStorage::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    async fn insert(&self, generation: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        let entries = dedup_by_key(entries);
        let mut storage = self.storage.write().await;
        if let Some(quota) = self.quota_bytes {
            let needed = storage.size_after(generation, &entries);
            if needed > quota {
                return Err(StoreError::QuotaExceeded { needed, quota });
            }
        }
        let cache = storage.open(generation);
        for entry in entries {
            trace!(generation, key = %entry.key, "Storing entry");
            cache.put(entry);
        }
        Ok(())
    }
}

impl CacheStore for MemoryCacheStore {
    fn open<'a>(&'a self, generation: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            self.storage.write().await.open(generation);
            Ok(())
        }
        .boxed()
    }

    fn get<'a>(
        &'a self,
        generation: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, StoreError>> {
        async move {
            let storage = self.storage.read().await;
            Ok(storage
                .get(generation)
                .and_then(|cache| cache.match_request(key))
                .cloned())
        }
        .boxed()
    }

    fn put<'a>(
        &'a self,
        generation: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.insert(generation, vec![entry]).boxed()
    }

    fn put_all<'a>(
        &'a self,
        generation: &'a str,
        entries: Vec<CacheEntry>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.insert(generation, entries).boxed()
    }

    fn delete<'a>(
        &'a self,
        generation: &'a str,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            let mut storage = self.storage.write().await;
            if !storage.has(generation) {
                return Ok(false);
            }
            Ok(storage.open(generation).delete(key))
        }
        .boxed()
    }

    fn keys<'a>(&'a self, generation: &'a str) -> BoxFuture<'a, Result<Vec<CacheKey>, StoreError>> {
        async move {
            let storage = self.storage.read().await;
            Ok(storage.get(generation).map(Cache::keys).unwrap_or_default())
        }
        .boxed()
    }

    fn generations(&self) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        async move { Ok(self.storage.read().await.keys()) }.boxed()
    }

    fn delete_generation<'a>(
        &'a self,
        generation: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        async move {
            let removed = self.storage.write().await.delete(generation);
            if removed {
                debug!(generation, "Deleted cache generation");
            }
            Ok(removed)
        }
        .boxed()
    }
}
