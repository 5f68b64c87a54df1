//! Fixed-window per-IP rate limiting for the login endpoint

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::models::ErrorResponse;

const WINDOW: Duration = Duration::from_secs(60);
const MAX_PER_WINDOW: u32 = 10;

/// Visitor map guarded by its own mutex
#[derive(Clone, Default)]
pub struct RateLimiter {
    visitors: Arc<Mutex<HashMap<IpAddr, (u32, Instant)>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit; false means the caller is over the limit.
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut visitors = self.visitors.lock().unwrap();
        let now = Instant::now();

        // Sweep expired windows so the map stays bounded
        visitors.retain(|_, (_, start)| now.duration_since(*start) < WINDOW);

        let (count, start) = visitors.entry(ip).or_insert((0, now));
        if now.duration_since(*start) >= WINDOW {
            *count = 0;
            *start = now;
        }
        *count += 1;
        *count <= MAX_PER_WINDOW
    }
}

/// Middleware applied to `/api/auth/login`.
pub async fn limit_logins(
    State(limiter): State<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    if !limiter.check(addr.ip()) {
        warn!(ip = %addr.ip(), "Login rate limit exceeded");
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: "Too many login attempts, try again later".to_string(),
                code: Some("RATE_LIMITED".to_string()),
            }),
        ));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_within_window() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..MAX_PER_WINDOW {
            assert!(limiter.check(ip));
        }
        assert!(!limiter.check(ip));
    }

    #[test]
    fn test_independent_ips() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "203.0.113.9".parse().unwrap();
        let b: IpAddr = "203.0.113.10".parse().unwrap();

        for _ in 0..MAX_PER_WINDOW {
            assert!(limiter.check(a));
        }
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }
}
