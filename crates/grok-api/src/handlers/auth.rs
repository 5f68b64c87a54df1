//! Login (with TOTP second step), logout, current user

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Duration;
use grok_auth::{verify_password, verify_totp, JwtClaims};
use grok_db::entities::user;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::extract_token;
use crate::middleware::csrf::CSRF_HEADER;
use crate::middleware::AuthUser;
use crate::models::{ErrorResponse, LoginRequest, LoginResponse, TwoFactorRequest, UserInfo};
use crate::AppState;

const SESSION_HOURS: i64 = 24;
const PENDING_2FA_MINUTES: i64 = 5;

/// Login with email/password.
///
/// Accounts with 2FA enabled may send `totp_code` inline; otherwise a
/// short-lived pending token is returned and the login finishes via
/// `POST /api/auth/2fa`.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued, or 2FA step required", body = LoginResponse),
        (status = 401, description = "Bad credentials", body = ErrorResponse),
    )
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account = user::Entity::find()
        .filter(user::Column::Email.eq(payload.email.to_ascii_lowercase()))
        .one(&state.db)
        .await?
        .filter(|u| u.is_active);

    let Some(account) = account else {
        warn!(email = %payload.email, "Login failed: unknown or inactive account");
        return Err(ApiError::Unauthorized);
    };

    let password_ok = verify_password(&payload.password, &account.password_hash)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !password_ok {
        warn!(user_id = %account.id, "Login failed: bad password");
        return Err(ApiError::Unauthorized);
    }

    if account.two_factor_enabled {
        let Some(secret) = account.two_factor_secret.clone() else {
            return Err(ApiError::Internal("2FA enabled without a secret".to_string()));
        };
        match payload.totp_code.as_deref() {
            Some(code) => {
                let ok =
                    verify_totp(&secret, code).map_err(|e| ApiError::Internal(e.to_string()))?;
                if !ok {
                    warn!(user_id = %account.id, "Login failed: bad TOTP code");
                    return Err(ApiError::Unauthorized);
                }
            }
            None => {
                // First step done; hand out a pending token only
                let claims = JwtClaims::new(
                    account.id,
                    account.role.clone(),
                    account.organization_id,
                    Duration::minutes(PENDING_2FA_MINUTES),
                )
                .with_pending_2fa();
                let token = state
                    .jwt
                    .validator
                    .encode(&claims)
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
                info!(user_id = %account.id, "Login first step ok, awaiting TOTP");
                return Ok((
                    HeaderMap::new(),
                    Json(LoginResponse {
                        token,
                        user: UserInfo::from(account),
                        two_factor_required: true,
                    }),
                ));
            }
        }
    }

    issue_session(&state, account)
}

/// Second login step: exchange the pending token plus a TOTP code for a
/// full session.
#[utoipa::path(
    post,
    path = "/api/auth/2fa",
    tag = "auth",
    request_body = TwoFactorRequest,
    responses(
        (status = 200, description = "Session issued", body = LoginResponse),
        (status = 401, description = "Bad or expired pending token, or bad code", body = ErrorResponse),
    )
)]
pub async fn verify_2fa(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let token = extract_token(&request).ok_or(ApiError::Unauthorized)?;
    let claims = state
        .jwt
        .validator
        .validate(&token)
        .map_err(|_| ApiError::Unauthorized)?;
    if !claims.pending_2fa {
        return Err(ApiError::BadRequest(
            "token is not a pending 2FA token".to_string(),
        ));
    }
    let user_id: Uuid = claims.user_id().map_err(|_| ApiError::Unauthorized)?;

    let (parts, body) = request.into_parts();
    drop(parts);
    let bytes = axum::body::to_bytes(body, 64 * 1024)
        .await
        .map_err(|_| ApiError::BadRequest("unreadable body".to_string()))?;
    let payload: TwoFactorRequest = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::BadRequest("expected {\"code\": \"...\"}".to_string()))?;

    let account = user::Entity::find_by_id(user_id)
        .one(&state.db)
        .await?
        .filter(|u| u.is_active)
        .ok_or(ApiError::Unauthorized)?;

    let Some(secret) = account.two_factor_secret.clone() else {
        return Err(ApiError::Internal("2FA enabled without a secret".to_string()));
    };
    let ok = verify_totp(&secret, &payload.code).map_err(|e| ApiError::Internal(e.to_string()))?;
    if !ok {
        warn!(user_id = %account.id, "2FA step failed: bad code");
        return Err(ApiError::Unauthorized);
    }

    issue_session(&state, account)
}

/// Mint the session JWT, set the cookie, and issue the first CSRF token.
fn issue_session(
    state: &AppState,
    account: user::Model,
) -> Result<(HeaderMap, Json<LoginResponse>), ApiError> {
    let claims = JwtClaims::new(
        account.id,
        account.role.clone(),
        account.organization_id,
        Duration::hours(SESSION_HOURS),
    );
    let token = state
        .jwt
        .validator
        .encode(&claims)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(user_id = %account.id, "Login ok");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        session_cookie(&token, state.is_https, SESSION_HOURS * 3600),
    );
    if let Ok(value) = HeaderValue::from_str(&state.csrf.issue()) {
        headers.insert(CSRF_HEADER, value);
    }

    Ok((
        headers,
        Json(LoginResponse {
            token,
            user: UserInfo::from(account),
            two_factor_required: false,
        }),
    ))
}

/// Clear the session cookie.
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    tag = "auth",
    responses((status = 204, description = "Session cleared"))
)]
pub async fn logout(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, session_cookie("", state.is_https, 0));
    (StatusCode::NO_CONTENT, headers)
}

/// The authenticated user's profile.
#[utoipa::path(
    get,
    path = "/api/auth/me",
    tag = "auth",
    responses(
        (status = 200, description = "Current user", body = UserInfo),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
    )
)]
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<UserInfo>, ApiError> {
    let account = user::Entity::find_by_id(auth.user_id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(UserInfo::from(account)))
}

fn session_cookie(token: &str, secure: bool, max_age_secs: i64) -> HeaderValue {
    let mut cookie = format!(
        "auth_token={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("auth_token="))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_flags() {
        let cookie = session_cookie("abc", true, 3600);
        let s = cookie.to_str().unwrap();
        assert!(s.contains("auth_token=abc"));
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("Secure"));
        assert!(s.contains("Max-Age=3600"));

        let cookie = session_cookie("abc", false, 3600);
        assert!(!cookie.to_str().unwrap().contains("Secure"));
    }
}
