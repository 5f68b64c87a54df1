//! Organizations, users, and domain reservations

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;
use grok_auth::hash_password;
use grok_db::entities::{domain, organization, user};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter,
    QueryOrder};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::{AuthUser, Role};
use crate::models::{
    CreateDomainRequest, CreateOrganizationRequest, CreateUserRequest, DomainInfo, ErrorResponse,
    OrganizationInfo, UpdateOrganizationRequest, UserInfo,
};
use crate::AppState;

// ---------------------------------------------------------------- organizations

/// List organizations (super admin only).
#[utoipa::path(
    get,
    path = "/api/organizations",
    tag = "organizations",
    responses((status = 200, description = "Organizations", body = [OrganizationInfo]))
)]
pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<OrganizationInfo>>, ApiError> {
    let rows = match auth.role {
        Role::SuperAdmin => {
            organization::Entity::find()
                .order_by_asc(organization::Column::Name)
                .all(&state.db)
                .await?
        }
        _ => {
            // Non-super callers see only their own organization
            organization::Entity::find()
                .filter(organization::Column::Id.eq(auth.org_id))
                .all(&state.db)
                .await?
        }
    };
    Ok(Json(rows.into_iter().map(OrganizationInfo::from).collect()))
}

/// Create an organization (super admin only).
#[utoipa::path(
    post,
    path = "/api/organizations",
    tag = "organizations",
    request_body = CreateOrganizationRequest,
    responses(
        (status = 201, description = "Created", body = OrganizationInfo),
        (status = 409, description = "Subdomain taken", body = ErrorResponse),
    )
)]
pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(payload): Json<CreateOrganizationRequest>,
) -> Result<(StatusCode, Json<OrganizationInfo>), ApiError> {
    if !auth.is_super_admin() {
        return Err(ApiError::Forbidden);
    }
    let subdomain = payload.subdomain.to_ascii_lowercase();
    if !is_valid_label(&subdomain) {
        return Err(ApiError::BadRequest(format!(
            "invalid organization subdomain {subdomain:?}"
        )));
    }

    let exists = organization::Entity::find()
        .filter(organization::Column::Subdomain.eq(subdomain.clone()))
        .one(&state.db)
        .await?;
    if exists.is_some() {
        return Err(ApiError::Conflict(format!(
            "organization subdomain {subdomain} already exists"
        )));
    }

    let row = organization::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(payload.name),
        subdomain: Set(subdomain),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    info!(org_id = %row.id, subdomain = %row.subdomain, "Organization created");
    Ok((StatusCode::CREATED, Json(OrganizationInfo::from(row))))
}

/// Update an organization; deactivation disconnects its live tunnels.
#[utoipa::path(
    patch,
    path = "/api/organizations/{id}",
    tag = "organizations",
    params(("id" = Uuid, Path, description = "Organization id")),
    request_body = UpdateOrganizationRequest,
    responses((status = 200, description = "Updated", body = OrganizationInfo))
)]
pub async fn update_organization(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrganizationRequest>,
) -> Result<Json<OrganizationInfo>, ApiError> {
    if !auth.is_super_admin() {
        return Err(ApiError::Forbidden);
    }
    let row = organization::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;

    let deactivating = payload.is_active == Some(false) && row.is_active;

    let mut am: organization::ActiveModel = row.into();
    if let Some(name) = payload.name {
        am.name = Set(name);
    }
    if let Some(is_active) = payload.is_active {
        am.is_active = Set(is_active);
    }
    am.updated_at = Set(Utc::now());
    let row = am.update(&state.db).await?;

    if deactivating {
        // Inbound traffic for this org must start failing now
        let victims: Vec<Uuid> = state
            .service
            .registry()
            .list()
            .into_iter()
            .filter(|h| h.meta.organization_id == Some(row.id))
            .map(|h| h.meta.id)
            .collect();
        for tunnel_id in victims {
            state.service.unregister(tunnel_id).await;
        }
        info!(org_id = %row.id, "Organization deactivated, live tunnels disconnected");
    }

    Ok(Json(OrganizationInfo::from(row)))
}

// ---------------------------------------------------------------- users

/// List users in the caller's scope.
#[utoipa::path(
    get,
    path = "/api/users",
    tag = "users",
    responses((status = 200, description = "Users", body = [UserInfo]))
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<UserInfo>>, ApiError> {
    let query = user::Entity::find().order_by_asc(user::Column::Email);
    let rows = match auth.role {
        Role::SuperAdmin => query.all(&state.db).await?,
        Role::OrgAdmin => {
            query
                .filter(user::Column::OrganizationId.eq(auth.org_id))
                .all(&state.db)
                .await?
        }
        Role::OrgUser => {
            query
                .filter(user::Column::Id.eq(auth.user_id))
                .all(&state.db)
                .await?
        }
    };
    Ok(Json(rows.into_iter().map(UserInfo::from).collect()))
}

/// Create a user (super admin anywhere; org admin within their org).
#[utoipa::path(
    post,
    path = "/api/users",
    tag = "users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "Created", body = UserInfo),
        (status = 409, description = "Email taken", body = ErrorResponse),
    )
)]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserInfo>), ApiError> {
    let target_org = match auth.role {
        Role::SuperAdmin => payload.organization_id,
        Role::OrgAdmin => {
            if payload.organization_id.is_some() && payload.organization_id != auth.org_id {
                return Err(ApiError::Forbidden);
            }
            auth.org_id
        }
        Role::OrgUser => return Err(ApiError::Forbidden),
    };

    if !matches!(payload.role.as_str(), "org_admin" | "org_user") {
        return Err(ApiError::BadRequest(format!(
            "role must be org_admin or org_user, got {:?}",
            payload.role
        )));
    }

    let email = payload.email.to_ascii_lowercase();
    let exists = user::Entity::find()
        .filter(user::Column::Email.eq(email.clone()))
        .one(&state.db)
        .await?;
    if exists.is_some() {
        return Err(ApiError::Conflict(format!("email {email} already registered")));
    }

    let password_hash =
        hash_password(&payload.password).map_err(|e| ApiError::Internal(e.to_string()))?;

    let row = user::ActiveModel {
        id: Set(Uuid::new_v4()),
        email: Set(email),
        password_hash: Set(password_hash),
        name: Set(payload.name),
        role: Set(payload.role),
        organization_id: Set(target_org),
        two_factor_enabled: Set(false),
        two_factor_secret: Set(None),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    info!(user_id = %row.id, by = %auth.user_id, "User created");
    Ok((StatusCode::CREATED, Json(UserInfo::from(row))))
}

/// Delete a user. Self-deletion is prohibited.
#[utoipa::path(
    delete,
    path = "/api/users/{id}",
    tag = "users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Forbidden (including self-deletion)", body = ErrorResponse),
    )
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if id == auth.user_id {
        return Err(ApiError::Forbidden);
    }
    let row = user::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !auth.can_manage(row.id, row.organization_id) || auth.role == Role::OrgUser {
        return Err(ApiError::Forbidden);
    }

    // Close anything the user still has live
    let victims: Vec<Uuid> = state
        .service
        .registry()
        .list()
        .into_iter()
        .filter(|h| h.meta.user_id == id)
        .map(|h| h.meta.id)
        .collect();
    for tunnel_id in victims {
        state.service.unregister(tunnel_id).await;
    }

    user::Entity::delete_by_id(id).exec(&state.db).await?;
    info!(user_id = %id, by = %auth.user_id, "User deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------- domains

/// List the caller's domain reservations.
#[utoipa::path(
    get,
    path = "/api/domains",
    tag = "domains",
    responses((status = 200, description = "Reservations", body = [DomainInfo]))
)]
pub async fn list_domains(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Vec<DomainInfo>>, ApiError> {
    let query = domain::Entity::find().order_by_asc(domain::Column::Subdomain);
    let rows = match auth.role {
        Role::SuperAdmin => query.all(&state.db).await?,
        Role::OrgAdmin => {
            query
                .filter(domain::Column::OrganizationId.eq(auth.org_id))
                .all(&state.db)
                .await?
        }
        Role::OrgUser => {
            query
                .filter(domain::Column::UserId.eq(auth.user_id))
                .all(&state.db)
                .await?
        }
    };
    Ok(Json(rows.into_iter().map(DomainInfo::from).collect()))
}

/// Reserve a full subdomain for the caller.
#[utoipa::path(
    post,
    path = "/api/domains",
    tag = "domains",
    request_body = CreateDomainRequest,
    responses(
        (status = 201, description = "Reserved", body = DomainInfo),
        (status = 409, description = "Already reserved", body = ErrorResponse),
    )
)]
pub async fn create_domain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Json(payload): Json<CreateDomainRequest>,
) -> Result<(StatusCode, Json<DomainInfo>), ApiError> {
    let subdomain = payload.subdomain.to_ascii_lowercase();
    if !is_valid_label(&subdomain) {
        return Err(ApiError::BadRequest(format!("invalid subdomain {subdomain:?}")));
    }

    let exists = domain::Entity::find()
        .filter(domain::Column::Subdomain.eq(subdomain.clone()))
        .one(&state.db)
        .await?;
    if exists.is_some() {
        return Err(ApiError::Conflict(format!("{subdomain} is already reserved")));
    }

    let row = domain::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(auth.user_id),
        organization_id: Set(auth.org_id),
        subdomain: Set(subdomain),
        is_reserved: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(&state.db)
    .await?;

    info!(domain_id = %row.id, subdomain = %row.subdomain, "Domain reserved");
    Ok((StatusCode::CREATED, Json(DomainInfo::from(row))))
}

/// Release a domain reservation.
#[utoipa::path(
    delete,
    path = "/api/domains/{id}",
    tag = "domains",
    params(("id" = Uuid, Path, description = "Reservation id")),
    responses((status = 204, description = "Released"))
)]
pub async fn delete_domain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let row = domain::Entity::find_by_id(id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    if !auth.can_manage(row.user_id, row.organization_id) {
        return Err(ApiError::Forbidden);
    }

    domain::Entity::delete_by_id(id).exec(&state.db).await?;
    info!(domain_id = %id, by = %auth.user_id, "Domain reservation released");
    Ok(StatusCode::NO_CONTENT)
}

/// DNS-label check shared by org subdomains and reservations.
fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && label.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_label() {
        assert!(is_valid_label("acme"));
        assert!(is_valid_label("acme-2"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("-acme"));
        assert!(!is_valid_label("acme-"));
        assert!(!is_valid_label("Acme"));
        assert!(!is_valid_label(&"a".repeat(64)));
    }
}
