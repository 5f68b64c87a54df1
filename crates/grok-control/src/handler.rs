//! Tunnel registration and lifecycle
//!
//! Implements the registration protocol: token authentication, quota
//! enforcement, subdomain composition and collision resolution, port
//! allocation, persistence, and event emission. The registry insert reserves
//! the public address atomically; database writes happen after, never under
//! the registry lock.

use chrono::Utc;
use grok_auth::hash_token;
use grok_db::entities::{auth_token, domain, tunnel, user};
use grok_events::{Event, EventBus};
use grok_proto::{ControlMessage, EndpointRequest, RegisterOptions, TunnelStatus, TunnelType};
use grok_registry::{PoolError, PortPool, RegistryError, TunnelHandle, TunnelMeta, TunnelRegistry};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Registration failures, surfaced to the client as a RegisterError frame
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token disabled")]
    TokenDisabled,

    #[error("Tunnel quota exceeded ({0} active)")]
    QuotaExceeded(usize),

    #[error("Invalid subdomain: {0}")]
    SubdomainInvalid(String),

    #[error("Subdomain {0} is taken")]
    SubdomainTaken(String),

    #[error("Client id {0} already has a live tunnel")]
    ClientIdInUse(String),

    #[error("No available ports")]
    NoAvailablePorts,

    #[error("Port {0} is in use")]
    PortInUse(u16),

    #[error("Organization is inactive")]
    OrgInactive,

    #[error("Internal error: {0}")]
    Internal(#[from] sea_orm::DbErr),
}

impl RegisterError {
    /// Stable machine-readable code carried on the wire and in API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RegisterError::AuthenticationFailed => "authentication_failed",
            RegisterError::TokenExpired => "token_expired",
            RegisterError::TokenDisabled => "token_disabled",
            RegisterError::QuotaExceeded(_) => "quota_exceeded",
            RegisterError::SubdomainInvalid(_) => "subdomain_invalid",
            RegisterError::SubdomainTaken(_) => "subdomain_taken",
            RegisterError::ClientIdInUse(_) => "client_id_in_use",
            RegisterError::NoAvailablePorts => "no_available_ports",
            RegisterError::PortInUse(_) => "port_in_use",
            RegisterError::OrgInactive => "org_inactive",
            RegisterError::Internal(_) => "internal",
        }
    }
}

/// Knobs the service reads from configuration
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Base public domain ("tunnel.example.com")
    pub domain: String,
    pub max_per_user: usize,
}

/// Registration and lifecycle service shared by the control listener and the
/// admin API.
pub struct TunnelService {
    db: DatabaseConnection,
    registry: Arc<TunnelRegistry>,
    pool: Arc<PortPool>,
    events: EventBus,
    settings: ServiceSettings,
}

impl TunnelService {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<TunnelRegistry>,
        pool: Arc<PortPool>,
        events: EventBus,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            db,
            registry,
            pool,
            events,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Authenticate a raw client token.
    ///
    /// Checks hash, active flag and expiry on the token, the owning user's
    /// active flag, and stamps `last_used_at`.
    pub async fn authenticate_token(
        &self,
        raw_token: &str,
    ) -> Result<(user::Model, auth_token::Model), RegisterError> {
        let hash = hash_token(raw_token);
        let token = auth_token::Entity::find()
            .filter(auth_token::Column::TokenHash.eq(hash))
            .one(&self.db)
            .await?
            .ok_or(RegisterError::AuthenticationFailed)?;

        if !token.is_active {
            return Err(RegisterError::TokenDisabled);
        }
        if let Some(expires_at) = token.expires_at {
            if expires_at < Utc::now() {
                return Err(RegisterError::TokenExpired);
            }
        }

        let owner = user::Entity::find_by_id(token.user_id)
            .one(&self.db)
            .await?
            .filter(|u| u.is_active)
            .ok_or(RegisterError::AuthenticationFailed)?;

        let mut stamp: auth_token::ActiveModel = token.clone().into();
        stamp.last_used_at = Set(Some(Utc::now()));
        let token = stamp.update(&self.db).await?;

        Ok((owner, token))
    }

    /// Register a tunnel for an authenticated client connection.
    ///
    /// On success the handle is live in the registry and the paired receiver
    /// feeds the connection's writer task.
    pub async fn register(
        &self,
        client_id: &str,
        raw_token: &str,
        endpoint: EndpointRequest,
        options: RegisterOptions,
    ) -> Result<(Arc<TunnelHandle>, mpsc::Receiver<ControlMessage>), RegisterError> {
        let (owner, token) = self.authenticate_token(raw_token).await?;

        let active = self.registry.count_for_user(owner.id);
        if active >= self.settings.max_per_user {
            return Err(RegisterError::QuotaExceeded(active));
        }

        let tunnel_type = endpoint.tunnel_type();
        let org = match owner.organization_id {
            Some(org_id) => {
                let org = grok_db::entities::organization::Entity::find_by_id(org_id)
                    .one(&self.db)
                    .await?;
                match org {
                    Some(org) if org.is_active => Some(org),
                    Some(_) => return Err(RegisterError::OrgInactive),
                    None => None,
                }
            }
            None => None,
        };

        // Compose the full public subdomain for HTTP-like tunnels
        let full_subdomain = match endpoint.subdomain() {
            Some(requested) => {
                validate_subdomain_label(requested)?;
                match &org {
                    Some(org) => format!("{}-{}", requested, org.subdomain),
                    None => requested.to_string(),
                }
            }
            None => String::new(),
        };

        // Collision resolution against live tunnels and Domain reservations
        let mut reusable = None;
        if tunnel_type.is_http_like() {
            if self.registry.subdomain_in_use(&full_subdomain) {
                return Err(RegisterError::SubdomainTaken(full_subdomain));
            }
            if let Some(reservation) = domain::Entity::find()
                .filter(domain::Column::Subdomain.eq(full_subdomain.clone()))
                .one(&self.db)
                .await?
            {
                if reservation.user_id != owner.id {
                    return Err(RegisterError::SubdomainTaken(full_subdomain));
                }
                // Same owner: reuse the prior offline tunnel row if present
                reusable = tunnel::Entity::find()
                    .filter(tunnel::Column::UserId.eq(owner.id))
                    .filter(tunnel::Column::Subdomain.eq(full_subdomain.clone()))
                    .filter(tunnel::Column::Status.ne(TunnelStatus::Active.as_str()))
                    .one(&self.db)
                    .await?;
            }
        }

        // Reconnection by saved name binds to the same row
        if reusable.is_none() {
            if let Some(saved_name) = &options.saved_name {
                reusable = tunnel::Entity::find()
                    .filter(tunnel::Column::UserId.eq(owner.id))
                    .filter(tunnel::Column::SavedName.eq(saved_name.clone()))
                    .one(&self.db)
                    .await?;
            }
        }

        // A row this client_id left behind is also fair game
        if reusable.is_none() {
            if let Some(row) = tunnel::Entity::find()
                .filter(tunnel::Column::ClientId.eq(client_id))
                .one(&self.db)
                .await?
            {
                if row.user_id != owner.id {
                    return Err(RegisterError::ClientIdInUse(client_id.to_string()));
                }
                reusable = Some(row);
            }
        }

        if let Some(row) = &reusable {
            if row.status == TunnelStatus::Active.as_str() && self.registry.get(row.id).is_some() {
                return Err(RegisterError::ClientIdInUse(client_id.to_string()));
            }
        }

        let tunnel_id = reusable.as_ref().map(|t| t.id).unwrap_or_else(Uuid::new_v4);

        // TCP tunnels need a public port before the registry insert
        let remote_port = match (&endpoint, reusable.as_ref().and_then(|t| t.remote_port)) {
            (EndpointRequest::Tcp { .. }, Some(previous)) => {
                Some(self.pool.reallocate(tunnel_id, previous as u16).map_err(
                    |e| match e {
                        PoolError::PortInUse(p) => RegisterError::PortInUse(p),
                        _ => RegisterError::NoAvailablePorts,
                    },
                )?)
            }
            (EndpointRequest::Tcp { .. }, None) => {
                Some(self.pool.allocate(tunnel_id).map_err(|e| match e {
                    PoolError::PortInUse(p) => RegisterError::PortInUse(p),
                    _ => RegisterError::NoAvailablePorts,
                })?)
            }
            _ => None,
        };

        let public_url = public_url(
            tunnel_type,
            &full_subdomain,
            &self.settings.domain,
            remote_port,
        );

        let meta = TunnelMeta {
            id: tunnel_id,
            user_id: owner.id,
            token_id: token.id,
            organization_id: org.as_ref().map(|o| o.id),
            tunnel_type,
            subdomain: full_subdomain.clone(),
            remote_port,
            local_addr: options.local_addr.clone(),
            public_url: public_url.clone(),
            client_id: client_id.to_string(),
            persistent: options.persistent,
        };

        // Reserve the public address atomically; the registry enforces
        // subdomain/port uniqueness against concurrent registrations.
        let (handle, outbound_rx) = TunnelHandle::new(meta);
        if let Err(e) = self.registry.insert(handle.clone()) {
            if let Some(port) = remote_port {
                let _ = self.pool.release(port, false);
            }
            return Err(match e {
                RegistryError::SubdomainTaken(s) => RegisterError::SubdomainTaken(s),
                RegistryError::PortTaken(p) => RegisterError::PortInUse(p),
                RegistryError::AlreadyRegistered(_) => {
                    RegisterError::ClientIdInUse(client_id.to_string())
                }
            });
        }

        // Persist after the address is reserved; roll back on failure
        let now = Utc::now();
        let persisted = match reusable {
            Some(row) => {
                let mut am: tunnel::ActiveModel = row.into();
                am.token_id = Set(token.id);
                am.organization_id = Set(org.as_ref().map(|o| o.id));
                am.tunnel_type = Set(tunnel_type.as_str().to_string());
                am.subdomain = Set(full_subdomain.clone());
                am.remote_port = Set(remote_port.map(|p| p as i32));
                am.local_addr = Set(options.local_addr.clone());
                am.public_url = Set(public_url.clone());
                am.client_id = Set(client_id.to_string());
                am.saved_name = Set(options.saved_name.clone());
                am.is_persistent = Set(options.persistent);
                am.status = Set(TunnelStatus::Active.as_str().to_string());
                am.connected_at = Set(now);
                am.disconnected_at = Set(None);
                am.last_activity_at = Set(now);
                am.update(&self.db).await
            }
            None => {
                tunnel::ActiveModel {
                    id: Set(tunnel_id),
                    user_id: Set(owner.id),
                    token_id: Set(token.id),
                    organization_id: Set(org.as_ref().map(|o| o.id)),
                    tunnel_type: Set(tunnel_type.as_str().to_string()),
                    subdomain: Set(full_subdomain.clone()),
                    remote_port: Set(remote_port.map(|p| p as i32)),
                    local_addr: Set(options.local_addr.clone()),
                    public_url: Set(public_url.clone()),
                    client_id: Set(client_id.to_string()),
                    saved_name: Set(options.saved_name.clone()),
                    is_persistent: Set(options.persistent),
                    status: Set(TunnelStatus::Active.as_str().to_string()),
                    bytes_in: Set(0),
                    bytes_out: Set(0),
                    requests_count: Set(0),
                    connected_at: Set(now),
                    disconnected_at: Set(None),
                    last_activity_at: Set(now),
                }
                .insert(&self.db)
                .await
            }
        };

        if let Err(e) = persisted {
            error!(tunnel_id = %tunnel_id, "Failed to persist tunnel row: {}", e);
            self.registry.remove(tunnel_id);
            handle.close();
            if let Some(port) = remote_port {
                let _ = self.pool.release(port, false);
            }
            return Err(RegisterError::Internal(e));
        }

        info!(
            tunnel_id = %tunnel_id,
            user_id = %owner.id,
            tunnel_type = tunnel_type.as_str(),
            public_url = %public_url,
            persistent = options.persistent,
            "Tunnel registered"
        );
        self.events.publish(Event::tunnel_registered(
            tunnel_id,
            tunnel_type.as_str(),
            &full_subdomain,
            remote_port,
        ));

        Ok((handle, outbound_rx))
    }

    /// Tear down a tunnel when its channel closes.
    ///
    /// Persistent tunnels go `offline` and keep their port reservation;
    /// everything else goes `disconnected` and frees the port.
    pub async fn unregister(&self, tunnel_id: Uuid) {
        let Some(handle) = self.registry.remove(tunnel_id) else {
            return;
        };
        handle.close();

        let persistent = handle.meta.persistent;
        let status = if persistent {
            TunnelStatus::Offline
        } else {
            TunnelStatus::Disconnected
        };

        if let Some(port) = handle.meta.remote_port {
            if let Err(e) = self.pool.release(port, persistent) {
                warn!(port, "Port release failed: {}", e);
            }
        }

        let result = tunnel::Entity::update_many()
            .col_expr(
                tunnel::Column::Status,
                sea_orm::sea_query::Expr::value(status.as_str()),
            )
            .col_expr(
                tunnel::Column::DisconnectedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .col_expr(
                tunnel::Column::BytesIn,
                sea_orm::sea_query::Expr::value(
                    handle.counters.bytes_in.load(Ordering::Relaxed) as i64
                ),
            )
            .col_expr(
                tunnel::Column::BytesOut,
                sea_orm::sea_query::Expr::value(
                    handle.counters.bytes_out.load(Ordering::Relaxed) as i64
                ),
            )
            .col_expr(
                tunnel::Column::RequestsCount,
                sea_orm::sea_query::Expr::value(
                    handle.counters.requests.load(Ordering::Relaxed) as i64
                ),
            )
            .filter(tunnel::Column::Id.eq(tunnel_id))
            .exec(&self.db)
            .await;

        if let Err(e) = result {
            error!(tunnel_id = %tunnel_id, "Failed to persist disconnect: {}", e);
        }

        info!(tunnel_id = %tunnel_id, status = status.as_str(), "Tunnel unregistered");
        self.events
            .publish(Event::tunnel_disconnected(tunnel_id, status.as_str()));
    }
}

/// Validate the client-chosen subdomain label (before org composition).
fn validate_subdomain_label(label: &str) -> Result<(), RegisterError> {
    let valid_len = (3..=63).contains(&label.len());
    let valid_chars = label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = label.starts_with(|c: char| c.is_ascii_alphanumeric())
        && label.ends_with(|c: char| c.is_ascii_alphanumeric());

    if valid_len && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(RegisterError::SubdomainInvalid(label.to_string()))
    }
}

fn public_url(
    tunnel_type: TunnelType,
    subdomain: &str,
    domain: &str,
    remote_port: Option<u16>,
) -> String {
    match tunnel_type {
        TunnelType::Http => format!("http://{subdomain}.{domain}"),
        TunnelType::Https => format!("https://{subdomain}.{domain}"),
        TunnelType::Tls => format!("tls://{subdomain}.{domain}"),
        TunnelType::Tcp => format!("tcp://{}:{}", domain, remote_port.unwrap_or(0)),
    }
}
