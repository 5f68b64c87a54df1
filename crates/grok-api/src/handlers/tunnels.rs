//! Tunnel visibility and control

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use grok_db::entities::{request_log, tunnel};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::{AuthUser, Role};
use crate::models::{ErrorResponse, RequestLogInfo, TunnelInfo};
use crate::AppState;

/// Scope a tunnel query to what the caller may see.
fn scoped(
    query: sea_orm::Select<tunnel::Entity>,
    auth: &AuthUser,
) -> sea_orm::Select<tunnel::Entity> {
    match auth.role {
        Role::SuperAdmin => query,
        Role::OrgAdmin => query.filter(tunnel::Column::OrganizationId.eq(auth.org_id)),
        Role::OrgUser => query.filter(tunnel::Column::UserId.eq(auth.user_id)),
    }
}

async fn load_owned(
    state: &AppState,
    auth: &AuthUser,
    id: Uuid,
) -> Result<tunnel::Model, ApiError> {
    let row = tunnel::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !auth.can_manage(row.user_id, row.organization_id) {
        return Err(ApiError::Forbidden);
    }
    Ok(row)
}

/// List tunnels in the caller's scope.
#[utoipa::path(
    get,
    path = "/api/tunnels",
    tag = "tunnels",
    responses((status = 200, description = "Tunnels", body = [TunnelInfo]))
)]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<TunnelInfo>>, ApiError> {
    let rows = scoped(tunnel::Entity::find(), &auth)
        .order_by_desc(tunnel::Column::ConnectedAt)
        .all(&state.db)
        .await?;
    Ok(Json(rows.into_iter().map(TunnelInfo::from).collect()))
}

/// One tunnel by id.
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}",
    tag = "tunnels",
    params(("id" = Uuid, Path, description = "Tunnel id")),
    responses(
        (status = 200, description = "Tunnel", body = TunnelInfo),
        (status = 404, description = "Unknown tunnel", body = ErrorResponse),
    )
)]
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<TunnelInfo>, ApiError> {
    let row = load_owned(&state, &auth, id).await?;
    Ok(Json(TunnelInfo::from(row)))
}

/// Disconnect (if live) and delete a tunnel.
#[utoipa::path(
    delete,
    path = "/api/tunnels/{id}",
    tag = "tunnels",
    params(("id" = Uuid, Path, description = "Tunnel id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Not your tunnel", body = ErrorResponse),
    )
)]
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let row = load_owned(&state, &auth, id).await?;

    // Close the live channel first so the registry and pool release
    state.service.unregister(row.id).await;
    tunnel::Entity::delete_by_id(row.id).exec(&state.db).await?;
    info!(tunnel_id = %row.id, by = %auth.user_id, "Tunnel deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RequestLogQuery {
    /// Restrict to one tunnel
    pub tunnel_id: Option<Uuid>,
    /// Max rows (default 100, cap 1000)
    pub limit: Option<u64>,
}

/// Recent request logs in the caller's scope.
#[utoipa::path(
    get,
    path = "/api/requests",
    tag = "traffic",
    params(RequestLogQuery),
    responses((status = 200, description = "Request logs", body = [RequestLogInfo]))
)]
pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Query(params): Query<RequestLogQuery>,
) -> Result<Json<Vec<RequestLogInfo>>, ApiError> {
    let limit = params.limit.unwrap_or(100).min(1000);

    let visible: Vec<Uuid> = match params.tunnel_id {
        Some(id) => {
            let row = load_owned(&state, &auth, id).await?;
            vec![row.id]
        }
        None => scoped(tunnel::Entity::find(), &auth)
            .all(&state.db)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect(),
    };

    let rows = request_log::Entity::find()
        .filter(request_log::Column::TunnelId.is_in(visible))
        .order_by_desc(request_log::Column::CreatedAt)
        .limit(limit)
        .all(&state.db)
        .await?;

    Ok(Json(rows.into_iter().map(RequestLogInfo::from).collect()))
}
