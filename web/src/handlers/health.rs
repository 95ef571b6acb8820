//! Health check endpoint.
//!
//! Used by load balancers to verify the process is serving. It does not
//! check the cache, broker or database: those failures surface per request
//! as 503 rather than taking the instance out of rotation.

use axum::http::StatusCode;

/// Liveness check.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
///
/// Returns `200 ok`.
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
