#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::faults::FaultSwitch;
use futures::future::ready;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use steadfast_core::cache::{Cache, CacheError, CacheFuture};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory cache for tests.
///
/// Entries expire on the tokio clock. Every operation counts towards
/// [`call_count`](Self::call_count) and consults the fault switch first, so a
/// test can make the cache unreachable for a fixed number of calls or
/// indefinitely.
///
/// # Example
///
/// ```
/// use steadfast_testing::InMemoryCache;
/// use steadfast_core::cache::Cache;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let cache = InMemoryCache::new();
/// cache.faults().fail_next(1);
/// assert!(cache.get("k").await.is_err());
/// assert_eq!(cache.get("k").await, Ok(None));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    faults: FaultSwitch,
    lost_replies: Arc<Mutex<HashMap<String, usize>>>,
    calls: Arc<AtomicUsize>,
}

impl InMemoryCache {
    /// Create an empty, healthy cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection switch.
    #[must_use]
    pub const fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    /// Lose the reply of the next `count` calls to `operation`.
    ///
    /// The operation still takes effect, then returns
    /// [`CacheError::Timeout`], like a reply lost on the way back from the
    /// server.
    pub fn lose_replies(&self, operation: &str, count: usize) {
        self.lost_replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), count);
    }

    fn reply_lost(&self, operation: &str) -> bool {
        let mut lost = self.lost_replies.lock().unwrap_or_else(PoisonError::into_inner);
        match lost.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Make every operation fail (or recover).
    pub fn set_failing(&self, failing: bool) {
        self.faults.set_failing(failing);
    }

    /// Number of operations attempted, including failed ones.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether a live entry exists, bypassing fault injection.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Live value for `key`, bypassing fault injection.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::live(&mut entries, key).map(|e| e.value.clone())
    }

    /// Remaining TTL for `key`, bypassing fault injection.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::live(&mut entries, key).map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }

    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            entries.remove(key);
        }
        entries.get(key)
    }

    fn guard(&self, op: &str, key: &str) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.trip() {
            return Err(CacheError::Connection(format!(
                "injected failure during {op} '{key}'"
            )));
        }
        Ok(())
    }

    fn run<T, F>(&self, op: &str, key: &str, f: F) -> CacheFuture<'_, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut HashMap<String, Entry>) -> T,
    {
        let result = self.guard(op, key).and_then(|()| {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let value = f(&mut entries);
            if self.reply_lost(op) {
                return Err(CacheError::Timeout(format!("reply lost during {op} '{key}'")));
            }
            Ok(value)
        });
        Box::pin(ready(result))
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> CacheFuture<'_, Option<String>> {
        self.run("get", key, |entries| {
            Self::live(entries, key).map(|e| e.value.clone())
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheFuture<'_, ()> {
        self.run("set", key, |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
        })
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheFuture<'_, bool> {
        self.run("set_if_absent", key, |entries| {
            if Self::live(entries, key).is_some() {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            true
        })
    }

    fn delete(&self, key: &str) -> CacheFuture<'_, ()> {
        self.run("delete", key, |entries| {
            entries.remove(key);
        })
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> CacheFuture<'_, bool> {
        self.run("delete_if_equals", key, |entries| {
            let matches = Self::live(entries, key).is_some_and(|e| e.value == expected);
            if matches {
                entries.remove(key);
            }
            matches
        })
    }

    fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> CacheFuture<'_, bool> {
        self.run("expire_if_equals", key, |entries| {
            let matches = Self::live(entries, key).is_some_and(|e| e.value == expected);
            if matches {
                if let Some(entry) = entries.get_mut(key) {
                    entry.expires_at = Instant::now() + ttl;
                }
            }
            matches
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lost_reply_still_applies_the_write() {
        let cache = InMemoryCache::new();
        cache.lose_replies("set_if_absent", 1);

        let result = cache.set_if_absent("lock", "me", Duration::from_secs(5)).await;

        assert!(matches!(result, Err(CacheError::Timeout(_))));
        assert_eq!(cache.peek("lock"), Some("me".to_string()));
        assert!(!cache.set_if_absent("lock", "me", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_is_exclusive_until_expiry() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(5);
        assert!(cache.set_if_absent("lock", "a", ttl).await.unwrap());
        assert!(!cache.set_if_absent("lock", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.set_if_absent("lock", "b", ttl).await.unwrap());
        assert_eq!(cache.peek("lock"), Some("b".to_string()));
    }

    #[tokio::test]
    async fn owner_checked_operations_ignore_other_owners() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(5);
        cache.set("lock", "owner-a", ttl).await.unwrap();

        assert!(!cache.delete_if_equals("lock", "owner-b").await.unwrap());
        assert!(!cache.expire_if_equals("lock", "owner-b", ttl).await.unwrap());
        assert!(cache.contains("lock"));

        assert!(cache.delete_if_equals("lock", "owner-a").await.unwrap());
        assert!(!cache.contains("lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_if_equals_extends_ttl() {
        let cache = InMemoryCache::new();
        cache.set("lock", "me", Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(cache.expire_if_equals("lock", "me", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.contains("lock"));
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let cache = InMemoryCache::new();
        cache.set_failing(true);
        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::Connection(_))
        ));
        assert!(cache.delete("k").await.is_err());
        assert_eq!(cache.call_count(), 2);
    }
}
