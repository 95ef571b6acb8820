//! Custom Axum extractors.
//!
//! - `IdempotencyKey`: the optional `Idempotency-Key` request header
//! - `ClientIp`: client IP address from proxy headers or the connection
//!
//! # Examples
//!
//! ```ignore
//! use steadfast_web::extractors::{ClientIp, IdempotencyKey};
//!
//! async fn create_task(
//!     State(state): State<AppState>,
//!     key: IdempotencyKey,
//!     client_ip: ClientIp,
//!     Json(request): Json<CreateTask>,
//! ) -> Response {
//!     tracing::info!(client_ip = %client_ip.0, "Creating task");
//!     gated(state.gate.clone(), key.0, move || create(request)).await
//! }
//! ```

use crate::error::AppError;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, Extensions, request::Parts},
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use steadfast_core::idempotency::RequestIdentity;

/// Header carrying the caller's request identity.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Optional request identity from the `Idempotency-Key` header.
///
/// A missing header yields `IdempotencyKey(None)`, and the request bypasses
/// the gate. A header that is present but empty, over-long, not valid
/// UTF-8 or full of control characters is rejected with 400 instead of being
/// silently ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub Option<RequestIdentity>);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(IDEMPOTENCY_KEY_HEADER) else {
            return Ok(Self(None));
        };

        let key = value
            .to_str()
            .map_err(|_| AppError::bad_request("Idempotency key must be visible ASCII"))?;

        Ok(Self(Some(RequestIdentity::new(key)?)))
    }
}

/// Client IP address.
///
/// # Priority
///
/// 1. `X-Forwarded-For` (first IP in the list)
/// 2. `X-Real-IP`
/// 3. Connection IP (when served with `ConnectInfo`)
/// 4. `127.0.0.1`
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(client_ip(&parts.headers, &parts.extensions)))
    }
}

/// Extract client IP from headers or connection info.
pub(crate) fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> IpAddr {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok());

    let real_ip = || {
        headers
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };

    let connection = || {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    };

    forwarded
        .or_else(real_ip)
        .or_else(connection)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
