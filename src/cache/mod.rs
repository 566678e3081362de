//! Response cache for read requests
//!
//! Concurrent identical reads are coalesced into one fetch, and completed
//! results are served from a TTL-bounded store. Failures are never cached.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::SyncError;

type CachedValue = Arc<dyn Any + Send + Sync>;
type PendingRequest = Shared<BoxFuture<'static, Result<CachedValue, SyncError>>>;

struct CacheEntry {
    value: CachedValue,
    created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, (u64, PendingRequest)>,
    next_request_id: u64,
    hits: u64,
    misses: u64,
    coalesced: u64,
}

/// Counters and sizes at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that joined an in-flight fetch instead of starting one.
    pub coalesced: u64,
    pub entries: usize,
    pub pending: usize,
}

pub struct ResponseCache {
    inner: Arc<Mutex<CacheInner>>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn lock(inner: &Mutex<CacheInner>) -> MutexGuard<'_, CacheInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build the cache key for an operation and its parameters. Object keys are
/// sorted so equal parameters always give the same key. Strings keep their
/// quotes so they never collide with an object rendered the same way.
pub fn key(operation: &str, params: &serde_json::Value) -> String {
    match params {
        serde_json::Value::Null => operation.to_string(),
        other => format!("{}:{}", operation, canonical_json(other)),
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            ttl,
            sweeper: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry-checked read. An expired entry is evicted and reported as a
    /// miss.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let value = lookup::<T>(&mut inner, key, Instant::now());
        if value.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        value
    }

    /// Store `value` for one TTL.
    pub fn set<T>(&self, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        let now = Instant::now();
        lock(&self.inner).entries.insert(
            key.to_string(),
            CacheEntry {
                value: Arc::new(value),
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Return the cached value, join an in-flight fetch for `key`, or start
    /// one with `fetch`. A successful result is cached; an error reaches
    /// every waiter and is not cached.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, fetch: F) -> Result<T, SyncError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let request = match self.lookup_or_pending::<T>(key) {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Pending(request) => request,
            Lookup::Miss => {
                // Futures are lazy: building it here makes no network call.
                let fut = fetch();
                self.register(key, fut)
            }
        };

        let value = request.await?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| SyncError::TypeMismatch {
                key: key.to_string(),
            })
    }

    fn lookup_or_pending<T>(&self, key: &str) -> Lookup<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        if let Some(value) = lookup::<T>(&mut inner, key, Instant::now()) {
            inner.hits += 1;
            return Lookup::Hit(value);
        }
        if let Some((_, request)) = inner.pending.get(key) {
            let request = request.clone();
            inner.coalesced += 1;
            tracing::debug!("Joining in-flight fetch for {}", key);
            return Lookup::Pending(request);
        }
        Lookup::Miss
    }

    fn register<T, Fut>(&self, key: &str, fut: Fut) -> PendingRequest
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let mut inner = lock(&self.inner);

        // Another caller may have registered between our lookup and now.
        if let Some((_, request)) = inner.pending.get(key) {
            let request = request.clone();
            inner.coalesced += 1;
            return request;
        }

        inner.misses += 1;
        let id = inner.next_request_id;
        inner.next_request_id += 1;

        tracing::debug!("Cache miss, fetching {}", key);

        let weak = Arc::downgrade(&self.inner);
        let ttl = self.ttl;
        let owned_key = key.to_string();
        let task = tokio::spawn(async move {
            let result = fut.await.map(|v| Arc::new(v) as CachedValue);
            settle(&weak, &owned_key, id, ttl, &result);
            result
        });

        let request = async move {
            task.await
                .unwrap_or_else(|e| Err(SyncError::Unreachable(format!("fetch task failed: {}", e))))
        }
        .boxed()
        .shared();

        inner.pending.insert(key.to_string(), (id, request.clone()));
        request
    }

    /// Remove one entry (and any fetch in flight for it).
    pub fn invalidate(&self, key: &str) {
        let mut inner = lock(&self.inner);
        let removed = inner.entries.remove(key).is_some();
        let cancelled = inner.pending.remove(key).is_some();
        if removed || cancelled {
            tracing::debug!("Invalidated cache key {}", key);
        }
    }

    /// Remove every entry whose key contains `pattern`.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.contains(pattern));
        inner.pending.retain(|k, _| !k.contains(pattern));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!("Invalidated {} cache entries matching '{}'", removed, pattern);
        }
        removed
    }

    /// Drop all entries, pending fetches and counters. Request ids keep
    /// counting so a fetch started before the clear can never settle into a
    /// slot registered after it.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.entries.clear();
        inner.pending.clear();
        inner.hits = 0;
        inner.misses = 0;
        inner.coalesced = 0;
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.inner)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = lock(&self.inner);
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            coalesced: inner.coalesced,
            entries: inner.entries.len(),
            pending: inner.pending.len(),
        }
    }

    /// Age of an entry, if present and fresh.
    pub fn age(&self, key: &str) -> Option<Duration> {
        let inner = lock(&self.inner);
        let now = Instant::now();
        inner
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| now.duration_since(e.created_at))
    }

    /// Start the periodic sweep. Replaces any running sweeper.
    pub fn start_sweeper(&self, every: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await; // skip first immediate tick
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = sweep_expired(&inner);
                if removed > 0 {
                    tracing::debug!("Cache sweep removed {} expired entries", removed);
                }
            }
        });

        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = sweeper.replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweeper and drop all state.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.clear();
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

enum Lookup<T> {
    Hit(T),
    Pending(PendingRequest),
    Miss,
}

fn lookup<T>(inner: &mut CacheInner, key: &str, now: Instant) -> Option<T>
where
    T: Clone + Send + Sync + 'static,
{
    let entry = inner.entries.get(key)?;
    if entry.is_expired(now) {
        inner.entries.remove(key);
        return None;
    }
    match entry.value.downcast_ref::<T>() {
        Some(v) => Some(v.clone()),
        None => {
            tracing::warn!("Cache entry {} read with a different type", key);
            None
        }
    }
}

/// Runs on the fetch task when it completes. Only the request still
/// registered under `key` may write its result; an invalidated one may not.
fn settle(
    weak: &Weak<Mutex<CacheInner>>,
    key: &str,
    id: u64,
    ttl: Duration,
    result: &Result<CachedValue, SyncError>,
) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut inner = lock(&inner);
    let ours = matches!(inner.pending.get(key), Some((pending_id, _)) if *pending_id == id);
    if !ours {
        return;
    }
    inner.pending.remove(key);

    match result {
        Ok(value) => {
            let now = Instant::now();
            inner.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: value.clone(),
                    created_at: now,
                    expires_at: now + ttl,
                },
            );
        }
        Err(e) => tracing::debug!("Fetch for {} failed, not caching: {}", key, e),
    }
}

fn sweep_expired(inner: &Mutex<CacheInner>) -> usize {
    let mut inner = lock(inner);
    let now = Instant::now();
    let before = inner.entries.len();
    inner.entries.retain(|_, e| !e.is_expired(now));
    before - inner.entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_key_is_deterministic() {
        let a = key("getChats", &json!({"page": 1, "limit": 20, "filter": {"b": 1, "a": 2}}));
        let b = key("getChats", &json!({"filter": {"a": 2, "b": 1}, "limit": 20, "page": 1}));
        assert_eq!(a, b);
        assert_eq!(key("getChats", &json!("A")), "getChats:\"A\"");
        assert_ne!(key("op", &json!("{\"a\":1}")), key("op", &json!({"a": 1})));
        assert_eq!(key("me", &serde_json::Value::Null), "me");
        assert_ne!(key("getChats", &json!({"page": 1})), key("getChats", &json!({"page": 2})));
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.set("k", vec![1, 2, 3]);
        assert_eq!(cache.get::<Vec<i32>>("k"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get::<Vec<i32>>("missing"), None);
        assert_eq!(cache.get::<String>("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted_on_get() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.set("k", "v".to_string());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get::<String>("k"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetch_is_single_flight() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..5).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_fetch("getChats:{}", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(vec!["chat-1".to_string()])
                    })
                    .await
            }
        });
        let results = futures::future::join_all(waiters).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in results {
            assert_eq!(r.unwrap(), vec!["chat-1".to_string()]);
        }

        let third = cache.get::<Vec<String>>("getChats:{}");
        assert_eq!(third, Some(vec!["chat-1".to_string()]));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert!(stats.hits >= 1);
        assert_eq!(stats.coalesced, 4);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_all_waiters_and_is_not_cached() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..3).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_fetch::<String, _, _>("contacts", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(SyncError::Unreachable("connection refused".into()))
                    })
                    .await
            }
        });
        for r in futures::future::join_all(waiters).await {
            assert_eq!(
                r.unwrap_err(),
                SyncError::Unreachable("connection refused".into())
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().pending, 0);
        assert_eq!(cache.stats().entries, 0);

        // Next call fetches again.
        let value = cache
            .get_or_fetch("contacts", || async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_fetch_does_not_write() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("getMessages:c1", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1u32)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.stats().pending, 1);

        cache.invalidate_pattern("c1");
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(cache.get::<u32>("getMessages:c1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_started_before_clear_does_not_write() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(300)));
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |value: &'static str, delay: u64| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("getMe", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        Ok(value.to_string())
                    })
                    .await
            })
        };

        let old = fetch("old-user", 50);
        tokio::time::sleep(Duration::from_millis(1)).await;
        cache.clear();

        let new = fetch("new-user", 200);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.stats().pending, 1);

        assert_eq!(old.await.unwrap().unwrap(), "old-user");
        assert_eq!(cache.get::<String>("getMe"), None);
        assert_eq!(cache.stats().pending, 1);

        // A caller arriving now still joins the post-clear fetch.
        let joined = fetch("third", 10);
        assert_eq!(joined.await.unwrap().unwrap(), "new-user");
        assert_eq!(new.await.unwrap().unwrap(), "new-user");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get::<String>("getMe").as_deref(), Some("new-user"));
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.set("getChats:A", 1);
        cache.set("getChats:B", 2);
        cache.set("getContacts", 3);

        assert_eq!(cache.invalidate_pattern("getChats"), 2);
        assert_eq!(cache.get::<i32>("getChats:A"), None);
        assert_eq!(cache.get::<i32>("getChats:B"), None);
        assert_eq!(cache.get::<i32>("getContacts"), Some(3));

        cache.invalidate("getContacts");
        assert_eq!(cache.get::<i32>("getContacts"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.start_sweeper(Duration::from_secs(60));
        cache.set("a", 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.stats().entries, 0);

        cache.set("b", 2);
        cache.shutdown();
        let stats = cache.stats();
        assert_eq!(stats, CacheStats::default());
    }

    #[tokio::test]
    async fn test_age() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        assert!(cache.age("k").is_none());
        cache.set("k", 1);
        assert!(cache.age("k").unwrap() < Duration::from_secs(1));
    }
}
