//! CSRF protection
//!
//! Server-side single-use tokens: state-changing requests must present a
//! valid `X-CSRF-Token` header; validation consumes the token and a fresh
//! one is rotated into the response header.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::ErrorResponse;

/// Token lifetime
const TOKEN_TTL: Duration = Duration::from_secs(3600);

pub const CSRF_HEADER: &str = "x-csrf-token";

/// Single-use token store
#[derive(Clone, Default)]
pub struct CsrfStore {
    tokens: Arc<Mutex<HashMap<String, Instant>>>,
}

impl CsrfStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token valid for one hour.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        let mut tokens = self.tokens.lock().unwrap();
        // Opportunistic expiry sweep
        tokens.retain(|_, issued| issued.elapsed() < TOKEN_TTL);
        tokens.insert(token.clone(), Instant::now());
        token
    }

    /// Consume a token. A second validation of the same token fails.
    pub fn validate(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.remove(token) {
            Some(issued) => issued.elapsed() < TOKEN_TTL,
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}

/// CSRF middleware for protected routes.
///
/// Safe methods pass through; state-changing methods must carry a valid
/// token and get a rotated one back in `X-CSRF-Token`.
pub async fn require_csrf(
    State(store): State<CsrfStore>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let state_changing = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );

    if state_changing {
        let presented = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !store.validate(presented) {
            return Err((
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: "Missing or invalid CSRF token".to_string(),
                    code: Some("CSRF".to_string()),
                }),
            ));
        }
    }

    let mut response = next.run(request).await;

    if state_changing && response.status().is_success() {
        let fresh = store.issue();
        if let Ok(value) = HeaderValue::from_str(&fresh) {
            response.headers_mut().insert(CSRF_HEADER, value);
        }
    }
    Ok(response)
}
