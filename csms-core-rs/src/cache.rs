//! Shared cache contract and an in-memory implementation
//!
//! Every module instance and the router share one cache. Keys are scoped by an
//! optional namespace; [`Cache::on_change`] is the long-poll primitive used to
//! wait for correlated responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Namespace used when none is given
pub const DEFAULT_NAMESPACE: &str = "default";

/// Outcome of waiting on a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    /// The key was written; carries the new value
    Updated(String),
    /// The key was removed or expired
    Removed,
    /// Nothing changed within the wait window
    TimedOut,
}

impl CacheChange {
    pub fn into_value(self) -> Option<String> {
        match self {
            CacheChange::Updated(v) => Some(v),
            CacheChange::Removed | CacheChange::TimedOut => None,
        }
    }
}

/// Key/value store with TTL and wait-for-change
#[async_trait]
pub trait Cache: Send + Sync {
    async fn exists(&self, key: &str, namespace: Option<&str>) -> bool;

    async fn get(&self, key: &str, namespace: Option<&str>) -> Option<String>;

    /// Write a value; `expire_seconds` of `None` keeps it until removed
    async fn set(&self, key: &str, value: String, namespace: Option<&str>, expire_seconds: Option<u64>) -> bool;

    /// Write only if absent (or expired); returns whether the write happened
    async fn set_if_not_exist(
        &self,
        key: &str,
        value: String,
        namespace: Option<&str>,
        expire_seconds: Option<u64>,
    ) -> bool;

    /// Remove a key; returns whether it existed
    async fn remove(&self, key: &str, namespace: Option<&str>) -> bool;

    /// Wait up to `wait` for the key to be written or removed
    async fn on_change(&self, key: &str, wait: Duration, namespace: Option<&str>) -> CacheChange;

    /// Current value if present, otherwise wait up to `wait` for a change
    async fn get_or_wait(&self, key: &str, wait: Duration, namespace: Option<&str>) -> CacheChange;
}

fn full_key(key: &str, namespace: Option<&str>) -> String {
    format!("{}:{}", namespace.unwrap_or(DEFAULT_NAMESPACE), key)
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local cache backed by a `HashMap`
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    changes: broadcast::Sender<String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(&self, key: String, value: String, expire_seconds: Option<u64>, only_if_absent: bool) -> bool {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            if only_if_absent {
                if let Some(existing) = entries.get(&key) {
                    if existing.is_live(now) {
                        return false;
                    }
                }
            }
            entries.insert(
                key.clone(),
                Entry {
                    value,
                    expires_at: expire_seconds.map(|s| now + Duration::from_secs(s)),
                },
            );
        }
        let _ = self.changes.send(key);
        true
    }

    fn read(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn changed(&self, key: &str, before: &Option<String>) -> Option<CacheChange> {
        let now = self.read(key);
        if &now == before {
            return None;
        }
        Some(match now {
            Some(value) => CacheChange::Updated(value),
            None => CacheChange::Removed,
        })
    }

    async fn watch(&self, key: String, wait: Duration, return_present: bool) -> CacheChange {
        // Subscribe before the first read so a write racing with this call is not missed.
        let mut changes = self.changes.subscribe();
        let before = self.read(&key);
        if return_present {
            if let Some(value) = &before {
                return CacheChange::Updated(value.clone());
            }
        }
        let deadline = Instant::now() + wait;

        loop {
            match tokio::time::timeout_at(deadline, changes.recv()).await {
                Ok(Ok(changed)) if changed == key => {
                    return match self.read(&key) {
                        Some(value) => CacheChange::Updated(value),
                        None => CacheChange::Removed,
                    };
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    // The event for this key may be among the skipped ones.
                    debug!("Cache watcher for {} lagged by {} events", key, skipped);
                    if let Some(change) = self.changed(&key, &before) {
                        return change;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    // The expiry of a TTL entry is a change too.
                    let now = Instant::now();
                    let mut entries = self.entries.lock();
                    let expired = entries.get(&key).is_some_and(|entry| !entry.is_live(now));
                    if expired {
                        entries.remove(&key);
                        return CacheChange::Removed;
                    }
                    return CacheChange::TimedOut;
                }
            }
        }
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn exists(&self, key: &str, namespace: Option<&str>) -> bool {
        self.read(&full_key(key, namespace)).is_some()
    }

    async fn get(&self, key: &str, namespace: Option<&str>) -> Option<String> {
        self.read(&full_key(key, namespace))
    }

    async fn set(&self, key: &str, value: String, namespace: Option<&str>, expire_seconds: Option<u64>) -> bool {
        self.write(full_key(key, namespace), value, expire_seconds, false)
    }

    async fn set_if_not_exist(
        &self,
        key: &str,
        value: String,
        namespace: Option<&str>,
        expire_seconds: Option<u64>,
    ) -> bool {
        self.write(full_key(key, namespace), value, expire_seconds, true)
    }

    async fn remove(&self, key: &str, namespace: Option<&str>) -> bool {
        let key = full_key(key, namespace);
        let existed = self.entries.lock().remove(&key).is_some();
        if existed {
            let _ = self.changes.send(key);
        }
        existed
    }

    async fn on_change(&self, key: &str, wait: Duration, namespace: Option<&str>) -> CacheChange {
        self.watch(full_key(key, namespace), wait, false).await
    }

    async fn get_or_wait(&self, key: &str, wait: Duration, namespace: Option<&str>) -> CacheChange {
        self.watch(full_key(key, namespace), wait, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespaced_set_get_remove() {
        let cache = MemoryCache::new();
        assert!(cache.set("k", "v1".into(), Some("a"), None).await);
        assert!(cache.set("k", "v2".into(), Some("b"), None).await);

        assert_eq!(cache.get("k", Some("a")).await.as_deref(), Some("v1"));
        assert_eq!(cache.get("k", Some("b")).await.as_deref(), Some("v2"));
        assert_eq!(cache.get("k", None).await, None);

        assert!(cache.remove("k", Some("a")).await);
        assert!(!cache.remove("k", Some("a")).await);
        assert!(!cache.exists("k", Some("a")).await);
        assert!(cache.exists("k", Some("b")).await);
    }

    #[tokio::test]
    async fn test_set_if_not_exist() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_not_exist("k", "first".into(), None, None).await);
        assert!(!cache.set_if_not_exist("k", "second".into(), None, None).await);
        assert_eq!(cache.get("k", None).await.as_deref(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), None, Some(5)).await;
        assert!(cache.exists("k", None).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.exists("k", None).await);
        assert!(cache.set_if_not_exist("k", "again".into(), None, Some(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_sees_update() {
        let cache = Arc::new(MemoryCache::new());
        let writer = cache.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.set("corr-1", "{\"ok\":true}".into(), Some("t1:CS001"), Some(10)).await;
        });

        let change = cache.on_change("corr-1", Duration::from_secs(5), Some("t1:CS001")).await;
        assert_eq!(change, CacheChange::Updated("{\"ok\":true}".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_sees_removal() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("k", "v".into(), None, None).await;
        let writer = cache.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.remove("k", None).await;
        });

        assert_eq!(cache.on_change("k", Duration::from_secs(5), None).await, CacheChange::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_times_out() {
        let cache = MemoryCache::new();
        let change = cache.on_change("missing", Duration::from_secs(2), None).await;
        assert_eq!(change, CacheChange::TimedOut);
        assert_eq!(change.into_value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_ignores_other_keys() {
        let cache = Arc::new(MemoryCache::new());
        let writer = cache.clone();

        tokio::spawn(async move {
            writer.set("other", "x".into(), None, None).await;
            writer.set("k", "x".into(), Some("elsewhere"), None).await;
        });

        assert_eq!(cache.on_change("k", Duration::from_secs(1), None).await, CacheChange::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_survives_a_flood_of_other_keys() {
        let cache = Arc::new(MemoryCache::new());
        let watcher = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.on_change("corr", Duration::from_secs(5), None).await })
        };
        // Let the watcher subscribe
        tokio::task::yield_now().await;

        // More writes than the change channel holds, without yielding in between
        cache.set("corr", "answer".into(), None, None).await;
        for i in 0..1100 {
            cache.set(&format!("other-{}", i), "x".into(), None, None).await;
        }

        assert_eq!(watcher.await.unwrap(), CacheChange::Updated("answer".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_wait() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("ready", "1".into(), None, None).await;
        assert_eq!(
            cache.get_or_wait("ready", Duration::from_secs(5), None).await,
            CacheChange::Updated("1".into())
        );

        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            writer.set("later", "2".into(), None, None).await;
        });
        assert_eq!(
            cache.get_or_wait("later", Duration::from_millis(500), None).await,
            CacheChange::Updated("2".into())
        );
        assert_eq!(
            cache.get_or_wait("never", Duration::from_millis(500), None).await,
            CacheChange::TimedOut
        );
    }
}
