//! Request middleware: source-aware authentication, rate limiting, request IDs

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::WebError;
use crate::listener::ConnectionSource;

/// Header carrying the API key on the TCP path
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// API key expected on TCP connections
#[derive(Debug, Clone, Default)]
pub struct ApiKeyConfig {
    /// When `None`, TCP authentication is disabled (local dev)
    pub api_key: Option<String>,
}

/// Authenticate a request according to its connection source
///
/// | Source | Auth |
/// |---|---|
/// | tcp | `X-API-Key` header must match |
/// | tray | peer credentials were verified at accept; nothing to check |
pub async fn api_key_middleware(
    State(config): State<Arc<ApiKeyConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, WebError> {
    let source = request
        .extensions()
        .get::<ConnectionSource>()
        .copied()
        .unwrap_or(ConnectionSource::Tcp);

    if source == ConnectionSource::Tray {
        return Ok(next.run(request).await);
    }

    if let Some(expected) = &config.api_key {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Err(WebError::Unauthorized("missing or invalid API key".into()));
        }
    }

    Ok(next.run(request).await)
}

/// Ensure every request carries an `x-request-id`, echoed on the response
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        return response;
    }
    next.run(request).await
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by client IP, TCP connections only
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    /// `per_minute` requests sustained, with the same burst capacity
    pub fn new(per_minute: u32) -> Arc<Self> {
        let capacity = per_minute.max(1) as f64;
        Arc::new(Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Try to take one token for a client
    pub fn check(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(addr).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate-limit middleware; local IPC connections bypass it
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, WebError> {
    let source = request
        .extensions()
        .get::<ConnectionSource>()
        .copied()
        .unwrap_or(ConnectionSource::Tcp);

    if source == ConnectionSource::Tcp {
        let addr = request
            .extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
            .map(|info| info.0.ip())
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        if !limiter.check(addr) {
            return Err(WebError::RateLimited);
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_burst_then_blocks() {
        let limiter = RateLimiter::new(10);
        let addr = IpAddr::from([10, 0, 0, 1]);
        for _ in 0..10 {
            assert!(limiter.check(addr));
        }
        assert!(!limiter.check(addr));
    }

    #[test]
    fn test_rate_limiter_is_per_client() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check(IpAddr::from([10, 0, 0, 1])));
        assert!(limiter.check(IpAddr::from([10, 0, 0, 2])));
        assert!(!limiter.check(IpAddr::from([10, 0, 0, 1])));
    }
}
