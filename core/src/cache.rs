//! Cache abstraction.
//!
//! The cache is a lossy, external key-value store. Values are strings,
//! every write carries a TTL, and [`Cache::set_if_absent`] is atomic so it can
//! serve as a distributed lock. The two `*_if_equals` operations compare the
//! stored value before acting, which lets a lock holder renew or release its
//! own lock without touching a lock another caller acquired after expiry.
//!
//! Callers are expected to wrap every operation in bounded retry; see the
//! runtime's `CacheGateway`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Could not reach the cache
    #[error("Cache connection failed: {0}")]
    Connection(String),

    /// The cache did not answer in time
    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    /// The cache answered with an error
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Boxed future returned by [`Cache`] operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Trait for cache implementations.
///
/// # Dyn Compatibility
///
/// Operations return [`CacheFuture`] rather than using `async fn` so the
/// cache can be shared as `Arc<dyn Cache>`.
pub trait Cache: Send + Sync {
    /// Read a value. `None` if absent or expired.
    fn get(&self, key: &str) -> CacheFuture<'_, Option<String>>;

    /// Write a value that expires after `ttl`, replacing any existing value.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheFuture<'_, ()>;

    /// Atomically write `value` only if `key` is absent.
    ///
    /// Returns `true` if this call created the entry.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheFuture<'_, bool>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> CacheFuture<'_, ()>;

    /// Atomically remove `key` only if it currently holds `expected`.
    ///
    /// Returns `true` if the entry was removed.
    fn delete_if_equals(&self, key: &str, expected: &str) -> CacheFuture<'_, bool>;

    /// Atomically reset the TTL of `key` only if it currently holds `expected`.
    ///
    /// Returns `true` if the TTL was updated.
    fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> CacheFuture<'_, bool>;
}
