//! Middleware chain: security headers, rate limiting, CSRF, authentication

pub mod auth;
pub mod csrf;
pub mod rate_limit;
pub mod security;

pub use auth::{require_auth, AuthUser, JwtState, Role};
pub use csrf::{require_csrf, CsrfStore};
pub use rate_limit::RateLimiter;
pub use security::security_headers;
