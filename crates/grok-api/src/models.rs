//! API request/response models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Structured error body
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// 6-digit TOTP code, required when the account has 2FA enabled
    #[serde(default)]
    pub totp_code: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    /// Session token, or a short-lived pending token when 2FA is required
    pub token: String,
    pub user: UserInfo,
    /// When true, finish the login via POST /api/auth/2fa
    pub two_factor_required: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TwoFactorRequest {
    /// 6-digit TOTP code
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub organization_id: Option<Uuid>,
    pub two_factor_enabled: bool,
}

impl From<grok_db::entities::user::Model> for UserInfo {
    fn from(u: grok_db::entities::user::Model) -> Self {
        Self {
            id: u.id,
            email: u.email,
            name: u.name,
            role: u.role,
            organization_id: u.organization_id,
            two_factor_enabled: u.two_factor_enabled,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    /// "org_admin" or "org_user" ("super_admin" only via bootstrap)
    pub role: String,
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub subdomain: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrganizationInfo {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<grok_db::entities::organization::Model> for OrganizationInfo {
    fn from(o: grok_db::entities::organization::Model) -> Self {
        Self {
            id: o.id,
            name: o.name,
            subdomain: o.subdomain,
            is_active: o.is_active,
            created_at: o.created_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTokenRequest {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateTokenResponse {
    /// Raw token, shown exactly once
    pub token: String,
    pub info: TokenInfo,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenInfo {
    pub id: Uuid,
    pub name: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<grok_db::entities::auth_token::Model> for TokenInfo {
    fn from(t: grok_db::entities::auth_token::Model) -> Self {
        Self {
            id: t.id,
            name: t.name,
            scopes: if t.scopes.is_empty() {
                Vec::new()
            } else {
                t.scopes.split(',').map(|s| s.to_string()).collect()
            },
            expires_at: t.expires_at,
            is_active: t.is_active,
            last_used_at: t.last_used_at,
            created_at: t.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tunnel_type: String,
    pub subdomain: String,
    pub remote_port: Option<i32>,
    pub public_url: String,
    pub local_addr: String,
    pub saved_name: Option<String>,
    pub is_persistent: bool,
    pub status: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub requests_count: i64,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl From<grok_db::entities::tunnel::Model> for TunnelInfo {
    fn from(t: grok_db::entities::tunnel::Model) -> Self {
        Self {
            id: t.id,
            user_id: t.user_id,
            tunnel_type: t.tunnel_type,
            subdomain: t.subdomain,
            remote_port: t.remote_port,
            public_url: t.public_url,
            local_addr: t.local_addr,
            saved_name: t.saved_name,
            is_persistent: t.is_persistent,
            status: t.status,
            bytes_in: t.bytes_in,
            bytes_out: t.bytes_out,
            requests_count: t.requests_count,
            connected_at: t.connected_at,
            disconnected_at: t.disconnected_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDomainRequest {
    /// Full composed subdomain to reserve
    pub subdomain: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DomainInfo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subdomain: String,
    pub is_reserved: bool,
    pub created_at: DateTime<Utc>,
}

impl From<grok_db::entities::domain::Model> for DomainInfo {
    fn from(d: grok_db::entities::domain::Model) -> Self {
        Self {
            id: d.id,
            user_id: d.user_id,
            subdomain: d.subdomain,
            is_reserved: d.is_reserved,
            created_at: d.created_at,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWebhookAppRequest {
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAppInfo {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub public_host: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWebhookRouteRequest {
    pub tunnel_id: Uuid,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    100
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookRouteInfo {
    pub id: Uuid,
    pub webhook_app_id: Uuid,
    pub tunnel_id: Uuid,
    pub priority: i32,
    pub is_enabled: bool,
    pub health_status: String,
    pub failure_count: i32,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl From<grok_db::entities::webhook_route::Model> for WebhookRouteInfo {
    fn from(r: grok_db::entities::webhook_route::Model) -> Self {
        Self {
            id: r.id,
            webhook_app_id: r.webhook_app_id,
            tunnel_id: r.tunnel_id,
            priority: r.priority,
            is_enabled: r.is_enabled,
            health_status: r.health_status,
            failure_count: r.failure_count,
            last_health_check: r.last_health_check,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RequestLogInfo {
    pub id: Uuid,
    pub tunnel_id: Uuid,
    pub method: String,
    pub path: String,
    pub status_code: i32,
    pub duration_ms: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub client_ip: String,
    pub created_at: DateTime<Utc>,
}

impl From<grok_db::entities::request_log::Model> for RequestLogInfo {
    fn from(r: grok_db::entities::request_log::Model) -> Self {
        Self {
            id: r.id,
            tunnel_id: r.tunnel_id,
            method: r.method,
            path: r.path,
            status_code: r.status_code,
            duration_ms: r.duration_ms,
            bytes_in: r.bytes_in,
            bytes_out: r.bytes_out,
            client_ip: r.client_ip,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PoolStatsInfo {
    pub start: u16,
    pub end: u16,
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    pub utilization: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    pub active_tunnels: usize,
    pub pool: PoolStatsInfo,
    pub sse_clients: usize,
    pub events_dropped: u64,
    pub log_records_dropped: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub database: String,
}
