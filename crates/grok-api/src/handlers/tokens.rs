//! Client token management

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use grok_auth::{generate_client_token, hash_token};
use grok_db::entities::{auth_token, user};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter,
    QueryOrder};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::{AuthUser, Role};
use crate::models::{CreateTokenRequest, CreateTokenResponse, ErrorResponse, TokenInfo};
use crate::AppState;

/// List tokens visible to the caller.
#[utoipa::path(
    get,
    path = "/api/tokens",
    tag = "tokens",
    responses((status = 200, description = "Tokens", body = [TokenInfo]))
)]
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<TokenInfo>>, ApiError> {
    let query = auth_token::Entity::find().order_by_desc(auth_token::Column::CreatedAt);

    let rows = match auth.role {
        Role::SuperAdmin => query.all(&state.db).await?,
        Role::OrgAdmin => {
            let org_users: Vec<Uuid> = user::Entity::find()
                .filter(user::Column::OrganizationId.eq(auth.org_id))
                .all(&state.db)
                .await?
                .into_iter()
                .map(|u| u.id)
                .collect();
            query
                .filter(auth_token::Column::UserId.is_in(org_users))
                .all(&state.db)
                .await?
        }
        Role::OrgUser => {
            query
                .filter(auth_token::Column::UserId.eq(auth.user_id))
                .all(&state.db)
                .await?
        }
    };

    Ok(Json(rows.into_iter().map(TokenInfo::from).collect()))
}

/// Mint a token for the caller. The raw value appears only in this response.
#[utoipa::path(
    post,
    path = "/api/tokens",
    tag = "tokens",
    request_body = CreateTokenRequest,
    responses(
        (status = 201, description = "Token created", body = CreateTokenResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(payload): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let raw = generate_client_token();
    let row = auth_token::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(auth.user_id),
        token_hash: Set(hash_token(&raw)),
        name: Set(payload.name.trim().to_string()),
        scopes: Set(payload.scopes.join(",")),
        expires_at: Set(payload.expires_at),
        is_active: Set(true),
        last_used_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    info!(user_id = %auth.user_id, token_id = %row.id, "Client token created");
    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: raw,
            info: TokenInfo::from(row),
        }),
    ))
}

/// Revoke and delete a token.
#[utoipa::path(
    delete,
    path = "/api/tokens/{id}",
    tag = "tokens",
    params(("id" = Uuid, Path, description = "Token id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Not your token", body = ErrorResponse),
        (status = 404, description = "Unknown token", body = ErrorResponse),
    )
)]
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let row = auth_token::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;

    let owner = user::Entity::find_by_id(row.user_id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !auth.can_manage(owner.id, owner.organization_id) {
        return Err(ApiError::Forbidden);
    }

    auth_token::Entity::delete_by_id(id).exec(&state.db).await?;
    info!(token_id = %id, by = %auth.user_id, "Client token deleted");
    Ok(StatusCode::NO_CONTENT)
}
