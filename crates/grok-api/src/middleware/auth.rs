//! Session authentication middleware and the RBAC model
//!
//! The session JWT arrives in the httpOnly `auth_token` cookie (dashboard)
//! or an `Authorization: Bearer` header (API clients). Handlers downstream
//! receive a validated [`AuthUser`] via request extensions.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use grok_auth::JwtValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::ErrorResponse;

/// User roles, most to least privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    SuperAdmin,
    OrgAdmin,
    OrgUser,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::OrgAdmin => "org_admin",
            Role::OrgUser => "org_user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "super_admin" => Some(Role::SuperAdmin),
            "org_admin" => Some(Role::OrgAdmin),
            "org_user" => Some(Role::OrgUser),
            _ => None,
        }
    }
}

/// Validated identity injected into request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
    pub org_id: Option<Uuid>,
}

impl AuthUser {
    /// Can this identity manage (read/write) a record owned by `owner` in
    /// `owner_org`? Super admins always; org admins within their org; users
    /// only their own records.
    pub fn can_manage(&self, owner: Uuid, owner_org: Option<Uuid>) -> bool {
        match self.role {
            Role::SuperAdmin => true,
            Role::OrgAdmin => self.org_id.is_some() && self.org_id == owner_org,
            Role::OrgUser => self.user_id == owner,
        }
    }

    pub fn is_super_admin(&self) -> bool {
        self.role == Role::SuperAdmin
    }
}

/// Shared validator state
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            validator: Arc::new(JwtValidator::new(secret)),
        }
    }
}

fn unauthorized(msg: &str, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: msg.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

/// Extract the session token from cookie or Authorization header.
pub fn extract_token(request: &Request) -> Option<String> {
    if let Some(cookie_header) = request.headers().get(header::COOKIE) {
        if let Some(token) = cookie_header.to_str().ok().and_then(|cookies| {
            cookies
                .split(';')
                .map(|c| c.trim())
                .find(|c| c.starts_with("auth_token="))
                .and_then(|c| c.strip_prefix("auth_token="))
        }) {
            return Some(token.to_string());
        }
    }

    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

/// Turn validated claims into an [`AuthUser`], rejecting half-done 2FA logins.
pub fn auth_user_from_claims(
    claims: &grok_auth::JwtClaims,
) -> Result<AuthUser, (StatusCode, Json<ErrorResponse>)> {
    if claims.pending_2fa {
        return Err(unauthorized(
            "Two-factor verification required",
            "PENDING_2FA",
        ));
    }
    let user_id = claims
        .user_id()
        .map_err(|_| unauthorized("Token missing a valid subject", "INVALID_TOKEN"))?;
    let role = Role::parse(&claims.role)
        .ok_or_else(|| unauthorized("Token carries an unknown role", "INVALID_TOKEN"))?;
    let org_id = match &claims.org_id {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| unauthorized("Token carries an invalid org", "INVALID_TOKEN"))?,
        ),
        None => None,
    };
    Ok(AuthUser {
        user_id,
        role,
        org_id,
    })
}

/// Authentication middleware for protected routes.
pub async fn require_auth(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let token = extract_token(&request)
        .ok_or_else(|| unauthorized("Missing authentication token", "MISSING_AUTH"))?;

    let claims = state
        .validator
        .validate(&token)
        .map_err(|e| unauthorized(&format!("Invalid or expired token: {e}"), "INVALID_TOKEN"))?;

    let auth_user = auth_user_from_claims(&claims)?;
    request.extensions_mut().insert(auth_user);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use chrono::Duration;
    use grok_auth::JwtClaims;
    use tower::ServiceExt;

    async fn protected(axum::Extension(user): axum::Extension<AuthUser>) -> String {
        format!("{}:{}", user.user_id, user.role.as_str())
    }

    fn app(secret: &[u8]) -> Router {
        let state = Arc::new(JwtState::new(secret));
        Router::new()
            .route("/protected", get(protected))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    fn token(secret: &[u8], claims: &JwtClaims) -> String {
        JwtValidator::new(secret).encode(claims).unwrap()
    }

    #[tokio::test]
    async fn test_bearer_token_accepted() {
        let secret = b"test-secret-key-0123456789abcdef";
        let user_id = Uuid::new_v4();
        let claims = JwtClaims::new(user_id, "org_admin".to_string(), None, Duration::hours(1));

        let response = app(secret)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token(secret, &claims)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cookie_accepted() {
        let secret = b"test-secret-key-0123456789abcdef";
        let claims = JwtClaims::new(
            Uuid::new_v4(),
            "org_user".to_string(),
            None,
            Duration::hours(1),
        );

        let response = app(secret)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/protected")
                    .header(
                        "Cookie",
                        format!("theme=dark; auth_token={}", token(secret, &claims)),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let secret = b"test-secret-key-0123456789abcdef";
        let response = app(secret)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_pending_2fa_rejected() {
        let secret = b"test-secret-key-0123456789abcdef";
        let claims = JwtClaims::new(
            Uuid::new_v4(),
            "org_user".to_string(),
            None,
            Duration::minutes(5),
        )
        .with_pending_2fa();

        let response = app(secret)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token(secret, &claims)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_rbac_matrix() {
        let org = Uuid::new_v4();
        let other_org = Uuid::new_v4();
        let me = Uuid::new_v4();
        let someone = Uuid::new_v4();

        let super_admin = AuthUser {
            user_id: me,
            role: Role::SuperAdmin,
            org_id: None,
        };
        assert!(super_admin.can_manage(someone, Some(other_org)));

        let org_admin = AuthUser {
            user_id: me,
            role: Role::OrgAdmin,
            org_id: Some(org),
        };
        assert!(org_admin.can_manage(someone, Some(org)));
        assert!(!org_admin.can_manage(someone, Some(other_org)));
        assert!(!org_admin.can_manage(someone, None));

        let org_user = AuthUser {
            user_id: me,
            role: Role::OrgUser,
            org_id: Some(org),
        };
        assert!(org_user.can_manage(me, Some(org)));
        assert!(!org_user.can_manage(someone, Some(org)));
    }
}
