//! Retrying front for the external cache.
//!
//! Every [`Cache`] operation is routed through a [`RetryExecutor`] with a
//! small fixed policy (3 attempts, 100ms base delay by default). When the
//! attempts run out the gateway reports
//! [`CacheGatewayError::Unavailable`], so callers can tell "the cache is
//! down" apart from any particular transport error.

use crate::metrics::CacheMetrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use steadfast_core::cache::{Cache, CacheError, CacheFuture};
use steadfast_core::environment::{Sleeper, TokioSleeper};
use thiserror::Error;

/// Cache gateway failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheGatewayError {
    /// Retries exhausted
    #[error("Cache unavailable during {operation}: {source}")]
    Unavailable {
        /// Operation that gave up
        operation: &'static str,
        /// Error from the last attempt
        #[source]
        source: CacheError,
    },
}

/// Default policy for cache calls.
#[must_use]
pub const fn default_cache_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(1))
        .build()
}

/// Cache access with bounded retry.
#[derive(Clone)]
pub struct CacheGateway {
    cache: Arc<dyn Cache>,
    retry: RetryExecutor<Arc<dyn Sleeper>>,
    policy: RetryPolicy,
}

impl CacheGateway {
    /// Wrap `cache` with the default policy and the tokio sleeper.
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            retry: RetryExecutor::new(Arc::new(TokioSleeper)),
            policy: default_cache_policy(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the sleeper used between attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = RetryExecutor::new(sleeper);
        self
    }

    /// The retry policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<'a, T, F>(
        &'a self,
        operation: &'static str,
        f: F,
    ) -> Result<T, CacheGatewayError>
    where
        F: FnMut() -> CacheFuture<'a, T>,
    {
        self.retry
            .run(&self.policy, f, |_: &CacheError| true)
            .await
            .map_err(|source| {
                CacheMetrics::record_unavailable(operation);
                CacheGatewayError::Unavailable { operation, source }
            })
    }

    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError::Unavailable`] once retries are exhausted.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheGatewayError> {
        self.call("get", || self.cache.get(key)).await
    }

    /// Write a value with a TTL.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError::Unavailable`] once retries are exhausted.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheGatewayError> {
        self.call("set", || self.cache.set(key, value, ttl)).await
    }

    /// Atomically create `key` if absent. Returns whether this call created it.
    ///
    /// A failed attempt may still have written the key before its reply was
    /// lost, so a later attempt sees the key as taken. When that happens the
    /// stored value is read back: if it equals `value` the key is ours. Callers
    /// must pass a value unique to this call (an owner token).
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError::Unavailable`] once retries are exhausted.
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheGatewayError> {
        let mut attempts = 0_u32;
        let acquired = self
            .call("set_if_absent", || {
                attempts += 1;
                self.cache.set_if_absent(key, value, ttl)
            })
            .await?;
        if acquired || attempts == 1 {
            return Ok(acquired);
        }

        let owned = self.get(key).await?.is_some_and(|stored| stored == value);
        if owned {
            tracing::debug!(key, attempts, "Earlier attempt created the key");
        }
        Ok(owned)
    }

    /// Remove a key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError::Unavailable`] once retries are exhausted.
    pub async fn delete(&self, key: &str) -> Result<(), CacheGatewayError> {
        self.call("delete", || self.cache.delete(key)).await
    }

    /// Remove `key` only if it holds `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError::Unavailable`] once retries are exhausted.
    pub async fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<bool, CacheGatewayError> {
        self.call("delete_if_equals", || self.cache.delete_if_equals(key, expected))
            .await
    }

    /// Reset the TTL of `key` only if it holds `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheGatewayError::Unavailable`] once retries are exhausted.
    pub async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheGatewayError> {
        self.call("expire_if_equals", || {
            self.cache.expire_if_equals(key, expected, ttl)
        })
        .await
    }
}

impl std::fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGateway")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
