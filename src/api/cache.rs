//! Response caching with freshness windows, plus coalescing of identical
//! in-flight requests.

use super::transport::{HttpRequest, HttpResponse};
use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

const KEY_PREFIX: &str = "bindery:";

/// Pluggable backing store for cached responses. Implementations may
/// evict entries at any time.
pub trait CacheStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStorage(RwLock<HashMap<String, String>>);

impl CacheStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Controls response caching for one caller.
#[derive(Clone)]
pub struct CachePolicy {
    pub max_age: Duration,
    /// Overrides the cache key. Returning None skips caching for that
    /// request.
    pub key: Option<Arc<dyn Fn(&HttpRequest) -> Option<String> + Send + Sync>>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            max_age: Duration::from_secs(3600),
            key: None,
        }
    }
}

impl CachePolicy {
    pub fn cache_key(&self, request: &HttpRequest) -> Option<String> {
        match &self.key {
            Some(f) => f(request),
            None => Some(request.identity_key()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CachedEntry {
    /// Unix seconds at store time.
    time: i64,
    max_age_secs: u64,
    status: u16,
    content_type: Option<String>,
    body: String,
}

impl CachedEntry {
    fn is_fresh(&self, now: i64) -> bool {
        now <= self.time + self.max_age_secs as i64
    }
}

/// Stores successful responses so later calls can hydrate instantly while
/// the network request proceeds in the background.
pub struct ResponseCache {
    storage: Arc<dyn CacheStorage>,
}

impl ResponseCache {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        ResponseCache { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::default()))
    }

    /// A cached response that is still inside its freshness window.
    pub fn get_fresh(&self, key: &str) -> Option<HttpResponse> {
        let raw = self.storage.get(&storage_key(key))?;
        let entry: CachedEntry = serde_json::from_str(&raw).ok()?;
        if !entry.is_fresh(now_secs()) {
            return None;
        }
        Some(HttpResponse {
            status: entry.status,
            content_type: entry.content_type,
            body: entry.body,
        })
    }

    /// Store a response, evicting every expired entry first so storage
    /// doesn't accumulate dead weight.
    pub fn store(&self, key: &str, response: &HttpResponse, max_age: Duration) {
        let now = now_secs();
        self.purge_stale(now);
        let entry = CachedEntry {
            time: now,
            max_age_secs: max_age.as_secs(),
            status: response.status,
            content_type: response.content_type.clone(),
            body: response.body.clone(),
        };
        if let Ok(raw) = serde_json::to_string(&entry) {
            self.storage.set(&storage_key(key), &raw);
        }
    }

    fn purge_stale(&self, now: i64) {
        for key in self.storage.keys() {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            let stale = match self.storage.get(&key) {
                Some(raw) => match serde_json::from_str::<CachedEntry>(&raw) {
                    Ok(entry) => !entry.is_fresh(now),
                    Err(_) => true,
                },
                None => continue,
            };
            if stale {
                self.storage.remove(&key);
            }
        }
    }
}

fn storage_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

type SharedOutcome = Arc<OnceCell<Result<HttpResponse, ApiError>>>;

/// Coalesces identical requests that are in flight at the same time. The
/// first task runs the request; the rest await its outcome. If the runner
/// is cancelled mid-flight, the next waiter takes over execution.
#[derive(Default)]
pub struct InflightRegistry {
    cells: Mutex<HashMap<String, SharedOutcome>>,
}

impl InflightRegistry {
    /// The shared slot for a request identity, creating it if this is the
    /// first participant.
    pub async fn join(&self, key: &str) -> SharedOutcome {
        let mut cells = self.cells.lock().await;
        cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Drop the slot once the outcome is settled so later requests hit the
    /// network again.
    pub async fn settle(&self, key: &str) {
        self.cells.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: body.to_string(),
        }
    }

    #[test]
    fn fresh_entries_round_trip() {
        let cache = ResponseCache::in_memory();
        cache.store("k1", &response("{\"a\":1}"), Duration::from_secs(60));
        let hit = cache.get_fresh("k1").unwrap();
        assert_eq!(hit.body, "{\"a\":1}");
        assert_eq!(hit.status, 200);
    }

    #[test]
    fn stale_entries_are_purged_on_next_store() {
        let storage = Arc::new(MemoryStorage::default());
        let cache = ResponseCache::new(storage.clone());
        // An entry whose freshness window already ended.
        let expired = CachedEntry {
            time: now_secs() - 100,
            max_age_secs: 1,
            status: 200,
            content_type: None,
            body: "old".into(),
        };
        storage.set(
            &storage_key("old"),
            &serde_json::to_string(&expired).unwrap(),
        );

        assert!(cache.get_fresh("old").is_none());
        cache.store("new", &response("fresh"), Duration::from_secs(60));
        assert!(storage.get(&storage_key("old")).is_none());
        assert!(storage.get(&storage_key("new")).is_some());
    }

    #[tokio::test]
    async fn inflight_slots_are_shared_then_dropped() {
        let registry = InflightRegistry::default();
        let a = registry.join("req").await;
        let b = registry.join("req").await;
        assert!(Arc::ptr_eq(&a, &b));

        registry.settle("req").await;
        let c = registry.join("req").await;
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
