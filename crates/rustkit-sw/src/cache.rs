//! Cache Storage: named buckets of request → response entries.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::Method;
use rustkit_net::{Request, Response, Url};
use tokio::sync::RwLock;
use tracing::trace;

use crate::ServiceWorkerError;

/// Cache key for a URL: the URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL (fragment removed).
    pub url: String,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(url: String, response: Response) -> Self {
        let cached_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            url,
            response,
            cached_at,
        }
    }
}

/// The `caches` global seen by a worker.
///
/// Each call is atomic with respect to other calls. Concurrent `put`s to the
/// same key resolve last-write-wins.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if absent.
    async fn open(&self, name: &str);

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> bool;

    /// Delete a bucket. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> bool;

    /// Bucket names in creation order.
    async fn keys(&self) -> Vec<String>;

    /// Match a request in one bucket.
    async fn match_in(&self, name: &str, request: &Request) -> Option<Response>;

    /// Match a request across buckets in creation order; returns the bucket
    /// name with the first hit.
    async fn match_any(&self, request: &Request) -> Option<(String, Response)>;

    /// Store a response, creating the bucket if absent.
    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError>;

    /// Store a batch: either every entry is written or none is.
    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(Request, Response)>,
    ) -> Result<(), ServiceWorkerError>;

    /// Snapshot of a bucket's entries, `None` if the bucket is absent.
    async fn entries(&self, name: &str) -> Option<Vec<CacheEntry>>;
}

// ==================== Cache ====================

/// A single named bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.entries.get(&cache_key(&request.url))
    }

    /// Add entry, replacing any previous one under the same key.
    pub fn put(&mut self, request: &Request, response: Response) {
        let key = cache_key(&request.url);
        self.entries
            .insert(key.clone(), CacheEntry::new(key, response));
    }

    /// Delete entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries.remove(&cache_key(&request.url)).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_cacheable(request: &Request) -> Result<(), ServiceWorkerError> {
    if request.method != Method::GET {
        return Err(ServiceWorkerError::CacheError(format!(
            "cannot cache {} {}",
            request.method, request.url
        )));
    }
    Ok(())
}

// ==================== Memory Cache Storage ====================

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_in<'a>(caches: &'a mut Vec<Cache>, name: &str) -> &'a mut Cache {
    match caches.iter().position(|c| c.name == name) {
        Some(idx) => &mut caches[idx],
        None => {
            caches.push(Cache::new(name));
            let last = caches.len() - 1;
            &mut caches[last]
        }
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) {
        open_in(&mut *self.caches.write().await, name);
    }

    async fn has(&self, name: &str) -> bool {
        self.caches.read().await.iter().any(|c| c.name == name)
    }

    async fn delete(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != name);
        caches.len() != before
    }

    async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    async fn match_in(&self, name: &str, request: &Request) -> Option<Response> {
        let caches = self.caches.read().await;
        let hit = caches
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.match_request(request))
            .map(|e| e.response.clone());
        trace!(cache = name, url = %request.url, hit = hit.is_some(), "cache match");
        hit
    }

    async fn match_any(&self, request: &Request) -> Option<(String, Response)> {
        let caches = self.caches.read().await;
        let hit = caches.iter().find_map(|c| {
            c.match_request(request)
                .map(|e| (c.name.clone(), e.response.clone()))
        });
        trace!(url = %request.url, hit = ?hit.as_ref().map(|(name, _)| name), "caches match");
        hit
    }

    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError> {
        check_cacheable(request)?;
        open_in(&mut *self.caches.write().await, name).put(request, response);
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(Request, Response)>,
    ) -> Result<(), ServiceWorkerError> {
        for (request, _) in &entries {
            check_cacheable(request)?;
        }
        let mut caches = self.caches.write().await;
        let cache = open_in(&mut caches, name);
        for (request, response) in entries {
            cache.put(&request, response);
        }
        Ok(())
    }

    async fn entries(&self, name: &str) -> Option<Vec<CacheEntry>> {
        let caches = self.caches.read().await;
        caches
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.entries.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{get, url};
    use http::StatusCode;

    fn response(path: &str, text: &str) -> Response {
        Response::new(url(path), StatusCode::OK, text.to_string())
    }

    #[test]
    fn test_cache_key_drops_fragment_keeps_query() {
        let u = Url::parse("https://app.example/a?x=1#top").unwrap();
        assert_eq!(cache_key(&u), "https://app.example/a?x=1");
    }

    #[test]
    fn test_cache_put_replaces() {
        let mut cache = Cache::new("v1");
        cache.put(&get("/style.css"), response("/style.css", "old"));
        cache.put(&get("/style.css"), response("/style.css", "new"));

        assert_eq!(cache.len(), 1);
        let hit = cache.match_request(&get("/style.css")).unwrap();
        assert_eq!(hit.response.text().unwrap(), "new");
        assert!(cache.match_request(&get("/other.css")).is_none());
    }

    #[test]
    fn test_cache_match_ignores_fragment() {
        let mut cache = Cache::new("v1");
        cache.put(&get("/about"), response("/about", "about"));
        assert!(cache.match_request(&get("/about#team")).is_some());
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        cache.put(&get("/a.js"), response("/a.js", "a"));
        assert!(cache.delete(&get("/a.js")));
        assert!(!cache.delete(&get("/a.js")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_post_never_matches() {
        let mut cache = Cache::new("v1");
        cache.put(&get("/form"), response("/form", "form"));
        let post = Request::post(url("/form"), Default::default());
        assert!(cache.match_request(&post).is_none());
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.has("v1").await);

        storage.open("v1").await;
        storage.open("v1").await;
        assert!(storage.has("v1").await);
        assert_eq!(storage.keys().await, vec!["v1"]);

        assert!(storage.delete("v1").await);
        assert!(!storage.delete("v1").await);
        assert!(!storage.has("v1").await);
    }

    #[tokio::test]
    async fn test_storage_keys_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        for name in ["precache-v0", "runtime", "precache-v1"] {
            storage.open(name).await;
        }
        assert_eq!(
            storage.keys().await,
            vec!["precache-v0", "runtime", "precache-v1"]
        );
    }

    #[tokio::test]
    async fn test_storage_match_any_first_bucket_wins() {
        let storage = MemoryCacheStorage::new();
        storage
            .put("first", &get("/"), response("/", "first"))
            .await
            .unwrap();
        storage
            .put("second", &get("/"), response("/", "second"))
            .await
            .unwrap();

        let (bucket, hit) = storage.match_any(&get("/")).await.unwrap();
        assert_eq!(bucket, "first");
        assert_eq!(hit.text().unwrap(), "first");
        assert!(storage.match_in("second", &get("/")).await.is_some());
        assert!(storage.match_in("missing", &get("/")).await.is_none());
    }

    #[tokio::test]
    async fn test_storage_put_rejects_post() {
        let storage = MemoryCacheStorage::new();
        let post = Request::post(url("/form"), Default::default());
        let result = storage.put("runtime", &post, response("/form", "x")).await;

        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
        assert!(!storage.has("runtime").await);
    }

    #[tokio::test]
    async fn test_storage_put_all_is_all_or_nothing() {
        let storage = MemoryCacheStorage::new();
        let entries = vec![
            (get("/"), response("/", "home")),
            (
                Request::post(url("/form"), Default::default()),
                response("/form", "x"),
            ),
        ];

        assert!(storage.put_all("precache-v1", entries).await.is_err());
        assert!(storage.entries("precache-v1").await.is_none());
    }

    #[tokio::test]
    async fn test_storage_put_all_empty_creates_bucket() {
        let storage = MemoryCacheStorage::new();
        storage.put_all("precache-v1", Vec::new()).await.unwrap();
        assert_eq!(storage.entries("precache-v1").await.unwrap().len(), 0);
    }
}
