//! Redis implementation of the Steadfast [`Cache`] trait.
//!
//! # Architecture
//!
//! - Plain reads and writes map to `GET`, `SET ... PX` and `DEL`
//! - [`Cache::set_if_absent`] is `SET key value NX PX ttl`, a single atomic command
//! - The owner-checked operations run as Lua scripts so the comparison and
//!   the delete (or expire) happen atomically on the server
//! - Connections are multiplexed and re-established by `ConnectionManager`
//!
//! Every command is bounded by an operation timeout so a stalled server
//! surfaces as [`CacheError::Timeout`] instead of hanging the caller.
//!
//! # Example
//!
//! ```no_run
//! use steadfast_redis::RedisCache;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCache::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::future::Future;
use std::time::Duration;
use steadfast_core::cache::{Cache, CacheError, CacheFuture};

const DELETE_IF_EQUALS: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

const EXPIRE_IF_EQUALS: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
";

/// Default per-command timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    operation_timeout: Duration,
    delete_if_equals: Script,
    expire_if_equals: Script,
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url).map_err(|e| {
            CacheError::Connection(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::Connection(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("Connected to Redis");

        Ok(Self {
            conn_manager,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
        })
    }

    /// Set the per-command timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        command: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.operation_timeout, command).await {
            Ok(result) => result.map_err(|e| map_error(operation, &e)),
            Err(_) => Err(CacheError::Timeout(format!(
                "{operation} exceeded {:?}",
                self.operation_timeout
            ))),
        }
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

fn map_error(operation: &str, error: &RedisError) -> CacheError {
    if error.is_timeout() {
        CacheError::Timeout(format!("{operation}: {error}"))
    } else if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        CacheError::Connection(format!("{operation}: {error}"))
    } else {
        CacheError::Backend(format!("{operation}: {error}"))
    }
}

/// TTL in whole milliseconds, at least 1 (Redis rejects `PX 0`).
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl Cache for RedisCache {
    fn get(&self, key: &str) -> CacheFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            self.bounded("get", async move { conn.get(&key).await }).await
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheFuture<'_, ()> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            self.bounded("set", async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await
        })
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheFuture<'_, bool> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            // Nil reply means the key already existed.
            let reply: Option<String> = self
                .bounded("set_if_absent", async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&value)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            Ok(reply.is_some())
        })
    }

    fn delete(&self, key: &str) -> CacheFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _removed: i64 = self.bounded("delete", async move { conn.del(&key).await }).await?;
            Ok(())
        })
    }

    fn delete_if_equals(&self, key: &str, expected: &str) -> CacheFuture<'_, bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: i64 = self
                .bounded("delete_if_equals", async move {
                    self.delete_if_equals
                        .key(&key)
                        .arg(&expected)
                        .invoke_async(&mut conn)
                        .await
                })
                .await?;
            Ok(removed == 1)
        })
    }

    fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> CacheFuture<'_, bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let updated: i64 = self
                .bounded("expire_if_equals", async move {
                    self.expire_if_equals
                        .key(&key)
                        .arg(&expected)
                        .arg(ttl_millis(ttl))
                        .invoke_async(&mut conn)
                        .await
                })
                .await?;
            Ok(updated == 1)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // Note: tests marked #[ignore] require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    fn unique(prefix: &str) -> String {
        format!("test:{prefix}:{}", uuid::Uuid::new_v4())
    }

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
    }

    #[tokio::test]
    async fn invalid_url_is_a_connection_error() {
        let err = RedisCache::connect("not a url").await.unwrap_err();
        assert!(matches!(err, CacheError::Connection(_)));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_set_if_absent_is_exclusive() {
        let cache = RedisCache::connect(REDIS_URL).await.unwrap();
        let key = unique("lock");

        assert!(cache.set_if_absent(&key, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_if_absent(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap(), Some("a".to_string()));

        cache.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_owner_checked_release_and_renewal() {
        let cache = RedisCache::connect(REDIS_URL).await.unwrap();
        let key = unique("owner");
        cache.set(&key, "token-1", Duration::from_secs(5)).await.unwrap();

        assert!(!cache.expire_if_equals(&key, "token-2", Duration::from_secs(60)).await.unwrap());
        assert!(cache.expire_if_equals(&key, "token-1", Duration::from_secs(60)).await.unwrap());
        assert!(!cache.delete_if_equals(&key, "token-2").await.unwrap());
        assert!(cache.delete_if_equals(&key, "token-1").await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_entries_expire() {
        let cache = RedisCache::connect(REDIS_URL).await.unwrap();
        let key = unique("ttl");
        cache.set(&key, "v", Duration::from_millis(100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(cache.get(&key).await.unwrap(), None);
    }
}
