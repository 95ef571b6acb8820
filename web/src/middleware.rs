//! Tower middleware for the HTTP front door.
//!
//! - **Request deadline**: requests that take longer than the deadline are
//!   answered with 408. The handler future is dropped; gated mutations keep
//!   running in their own task (see [`crate::gated`]).
//! - **Rate limiting**: fixed-window request counting per client IP,
//!   answered with 429 once the window's budget is spent.
//!
//! Both reject with the standard `{status, message}` error body.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use steadfast_web::middleware::{RateLimitLayer, RequestDeadlineLayer};
//!
//! let app = Router::new()
//!     .route("/api/tasks", post(create_task))
//!     .layer(RequestDeadlineLayer::new(Duration::from_secs(10)))
//!     .layer(RateLimitLayer::new(100, Duration::from_secs(60)));
//! ```
//!
//! The limiter is per process; it sheds load and carries no correctness role.

use crate::error::AppError;
use crate::extractors::client_ip;
use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};

/// Default request deadline.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(10);

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Layer that bounds every request by a deadline.
#[derive(Clone, Copy, Debug)]
pub struct RequestDeadlineLayer {
    deadline: Duration,
}

impl RequestDeadlineLayer {
    /// Create a layer answering 408 after `deadline`.
    #[must_use]
    pub const fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl Default for RequestDeadlineLayer {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_DEADLINE)
    }
}

impl<S> Layer<S> for RequestDeadlineLayer {
    type Service = RequestDeadline<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestDeadline {
            inner,
            deadline: self.deadline,
        }
    }
}

/// Middleware service enforcing the request deadline.
#[derive(Clone, Debug)]
pub struct RequestDeadline<S> {
    inner: S,
    deadline: Duration,
}

impl<S> Service<Request> for RequestDeadline<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let deadline = self.deadline;
        let fut = self.inner.call(req);

        Box::pin(async move {
            if let Ok(result) = tokio::time::timeout(deadline, fut).await {
                result
            } else {
                tracing::warn!(
                    %method,
                    %uri,
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "Request deadline exceeded"
                );
                metrics::counter!("http_request_deadline_exceeded_total").increment(1);
                Ok(AppError::timeout("Request deadline exceeded").into_response())
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counters keyed by client IP.
#[derive(Debug)]
struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

/// Forget idle clients once the table grows past this size.
const PRUNE_THRESHOLD: usize = 10_000;

impl RateLimiter {
    fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.started) < self.window);
        }

        let entry = windows.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= self.max_requests {
            false
        } else {
            entry.count += 1;
            true
        }
    }
}

/// Layer that limits requests per client IP in fixed windows.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    /// Allow `max_requests` per client IP in each `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            limiter: Arc::new(RateLimiter {
                max_requests,
                window,
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// Middleware service enforcing the per-IP rate limit.
#[derive(Clone, Debug)]
pub struct RateLimit<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request> for RateLimit<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let ip = client_ip(req.headers(), req.extensions());

        if !self.limiter.check(ip) {
            tracing::debug!(client_ip = %ip, "Rate limit exceeded");
            metrics::counter!("http_rate_limited_total").increment(1);
            return Box::pin(async {
                Ok(AppError::too_many_requests("Too many requests").into_response())
            });
        }

        Box::pin(self.inner.call(req))
    }
}
