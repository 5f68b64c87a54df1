//! Webhook app and route management

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use grok_db::entities::{organization, tunnel, webhook_app, webhook_event, webhook_route};
use grok_webhook::validate_app_name;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::{AuthUser, Role};
use crate::models::{
    CreateWebhookAppRequest, CreateWebhookRouteRequest, ErrorResponse, WebhookAppInfo,
    WebhookRouteInfo,
};
use crate::AppState;

fn app_info(app: webhook_app::Model, org_subdomain: &str, base_domain: &str) -> WebhookAppInfo {
    WebhookAppInfo {
        id: app.id,
        organization_id: app.organization_id,
        public_host: format!("{}-{}-webhook.{}", app.name, org_subdomain, base_domain),
        name: app.name,
        is_active: app.is_active,
        created_at: app.created_at,
    }
}

async fn load_app_checked(
    state: &AppState,
    auth: &AuthUser,
    id: Uuid,
) -> Result<(webhook_app::Model, organization::Model), ApiError> {
    let app = webhook_app::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !auth.can_manage(app.user_id, Some(app.organization_id)) {
        return Err(ApiError::Forbidden);
    }
    let org = organization::Entity::find_by_id(app.organization_id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok((app, org))
}

/// List webhook apps in the caller's scope.
#[utoipa::path(
    get,
    path = "/api/webhooks/apps",
    tag = "webhooks",
    responses((status = 200, description = "Webhook apps", body = [WebhookAppInfo]))
)]
pub async fn list_apps(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<WebhookAppInfo>>, ApiError> {
    let query = webhook_app::Entity::find().order_by_asc(webhook_app::Column::Name);
    let rows = match auth.role {
        Role::SuperAdmin => query.all(&state.db).await?,
        Role::OrgAdmin => {
            query
                .filter(webhook_app::Column::OrganizationId.eq(auth.org_id))
                .all(&state.db)
                .await?
        }
        Role::OrgUser => {
            query
                .filter(webhook_app::Column::UserId.eq(auth.user_id))
                .all(&state.db)
                .await?
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for app in rows {
        let org = organization::Entity::find_by_id(app.organization_id)
            .one(&state.db)
            .await?
            .ok_or(ApiError::NotFound)?;
        out.push(app_info(app, &org.subdomain, &state.domain));
    }
    Ok(Json(out))
}

/// Create a webhook app in the caller's organization.
#[utoipa::path(
    post,
    path = "/api/webhooks/apps",
    tag = "webhooks",
    request_body = CreateWebhookAppRequest,
    responses(
        (status = 201, description = "Created", body = WebhookAppInfo),
        (status = 409, description = "Name taken in organization", body = ErrorResponse),
    )
)]
pub async fn create_app(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(payload): Json<CreateWebhookAppRequest>,
) -> Result<(StatusCode, Json<WebhookAppInfo>), ApiError> {
    let Some(org_id) = auth.org_id else {
        return Err(ApiError::BadRequest(
            "webhook apps require an organization".to_string(),
        ));
    };
    let name = payload.name.to_ascii_lowercase();
    if !validate_app_name(&name) {
        return Err(ApiError::BadRequest(format!("invalid app name {name:?}")));
    }

    let org = organization::Entity::find_by_id(org_id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;

    let exists = webhook_app::Entity::find()
        .filter(webhook_app::Column::OrganizationId.eq(org_id))
        .filter(webhook_app::Column::Name.eq(name.clone()))
        .one(&state.db)
        .await?;
    if exists.is_some() {
        return Err(ApiError::Conflict(format!(
            "app {name} already exists in this organization"
        )));
    }

    let row = webhook_app::ActiveModel {
        id: Set(Uuid::new_v4()),
        organization_id: Set(org_id),
        user_id: Set(auth.user_id),
        name: Set(name),
        is_active: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    info!(app_id = %row.id, name = %row.name, "Webhook app created");
    Ok((
        StatusCode::CREATED,
        Json(app_info(row, &org.subdomain, &state.domain)),
    ))
}

/// Delete a webhook app (routes and events cascade).
#[utoipa::path(
    delete,
    path = "/api/webhooks/apps/{id}",
    tag = "webhooks",
    params(("id" = Uuid, Path, description = "App id")),
    responses((status = 204, description = "Deleted"))
)]
pub async fn delete_app(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let (app, _org) = load_app_checked(&state, &auth, id).await?;
    webhook_app::Entity::delete_by_id(app.id).exec(&state.db).await?;
    info!(app_id = %app.id, by = %auth.user_id, "Webhook app deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// List an app's routes.
#[utoipa::path(
    get,
    path = "/api/webhooks/apps/{id}/routes",
    tag = "webhooks",
    params(("id" = Uuid, Path, description = "App id")),
    responses((status = 200, description = "Routes", body = [WebhookRouteInfo]))
)]
pub async fn list_routes(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WebhookRouteInfo>>, ApiError> {
    let (app, _org) = load_app_checked(&state, &auth, id).await?;
    let rows = webhook_route::Entity::find()
        .filter(webhook_route::Column::WebhookAppId.eq(app.id))
        .order_by_asc(webhook_route::Column::Priority)
        .all(&state.db)
        .await?;
    Ok(Json(rows.into_iter().map(WebhookRouteInfo::from).collect()))
}

/// Attach a tunnel to an app.
#[utoipa::path(
    post,
    path = "/api/webhooks/apps/{id}/routes",
    tag = "webhooks",
    params(("id" = Uuid, Path, description = "App id")),
    request_body = CreateWebhookRouteRequest,
    responses(
        (status = 201, description = "Created", body = WebhookRouteInfo),
        (status = 409, description = "Route already exists", body = ErrorResponse),
    )
)]
pub async fn create_route(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CreateWebhookRouteRequest>,
) -> Result<(StatusCode, Json<WebhookRouteInfo>), ApiError> {
    let (app, _org) = load_app_checked(&state, &auth, id).await?;

    let target = tunnel::Entity::find_by_id(payload.tunnel_id)
        .one(&state.db)
        .await?
        .ok_or_else(|| ApiError::BadRequest("unknown tunnel".to_string()))?;
    if !auth.can_manage(target.user_id, target.organization_id) {
        return Err(ApiError::Forbidden);
    }

    let exists = webhook_route::Entity::find()
        .filter(webhook_route::Column::WebhookAppId.eq(app.id))
        .filter(webhook_route::Column::TunnelId.eq(target.id))
        .one(&state.db)
        .await?;
    if exists.is_some() {
        return Err(ApiError::Conflict(
            "this tunnel is already routed for the app".to_string(),
        ));
    }

    let row = webhook_route::ActiveModel {
        id: Set(Uuid::new_v4()),
        webhook_app_id: Set(app.id),
        tunnel_id: Set(target.id),
        priority: Set(payload.priority),
        is_enabled: Set(true),
        health_status: Set("unknown".to_string()),
        failure_count: Set(0),
        last_health_check: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    info!(app_id = %app.id, route_id = %row.id, tunnel_id = %target.id, "Webhook route created");
    Ok((StatusCode::CREATED, Json(WebhookRouteInfo::from(row))))
}

/// Remove a route.
#[utoipa::path(
    delete,
    path = "/api/webhooks/routes/{id}",
    tag = "webhooks",
    params(("id" = Uuid, Path, description = "Route id")),
    responses((status = 204, description = "Deleted"))
)]
pub async fn delete_route(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let route = webhook_route::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    // Route access follows the owning app
    let (_app, _org) = load_app_checked(&state, &auth, route.webhook_app_id).await?;

    webhook_route::Entity::delete_by_id(id).exec(&state.db).await?;
    info!(route_id = %id, by = %auth.user_id, "Webhook route deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Max rows (default 50, cap 500)
    pub limit: Option<u64>,
}

/// Recent delivery events for an app, newest first.
#[utoipa::path(
    get,
    path = "/api/webhooks/apps/{id}/events",
    tag = "webhooks",
    params(("id" = Uuid, Path, description = "App id"), EventsQuery),
    responses((status = 200, description = "Events"))
)]
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<Vec<webhook_event::Model>>, ApiError> {
    let (app, _org) = load_app_checked(&state, &auth, id).await?;
    let limit = params.limit.unwrap_or(50).min(500);

    let rows = webhook_event::Entity::find()
        .filter(webhook_event::Column::WebhookAppId.eq(app.id))
        .order_by_desc(webhook_event::Column::CreatedAt)
        .limit(limit)
        .all(&state.db)
        .await?;
    Ok(Json(rows))
}
