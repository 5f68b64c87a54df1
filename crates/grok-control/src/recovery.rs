//! Startup recovery
//!
//! Rows left `active` by a previous process are demoted (offline when
//! persistent, disconnected otherwise), then the port pool rehydrates from
//! what survived: active tunnels plus persistent offline reservations.

use grok_db::entities::tunnel;
use grok_proto::TunnelStatus;
use grok_registry::PortPool;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use tracing::info;
use uuid::Uuid;

/// Demote stale rows and rebuild the port pool.
pub async fn recover_pool(
    db: &DatabaseConnection,
    port_start: u16,
    port_end: u16,
) -> Result<PortPool, DbErr> {
    // No channel survives a restart, so nothing can really be active
    let demoted_offline = tunnel::Entity::update_many()
        .col_expr(
            tunnel::Column::Status,
            Expr::value(TunnelStatus::Offline.as_str()),
        )
        .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
        .filter(tunnel::Column::IsPersistent.eq(true))
        .exec(db)
        .await?
        .rows_affected;

    let demoted_disconnected = tunnel::Entity::update_many()
        .col_expr(
            tunnel::Column::Status,
            Expr::value(TunnelStatus::Disconnected.as_str()),
        )
        .filter(tunnel::Column::Status.eq(TunnelStatus::Active.as_str()))
        .exec(db)
        .await?
        .rows_affected;

    if demoted_offline + demoted_disconnected > 0 {
        info!(
            offline = demoted_offline,
            disconnected = demoted_disconnected,
            "Demoted stale active tunnels from previous run"
        );
    }

    // Persistent offline tunnels keep their reservations across restarts
    let reserved: Vec<(u16, Uuid)> = tunnel::Entity::find()
        .filter(tunnel::Column::RemotePort.is_not_null())
        .filter(tunnel::Column::Status.eq(TunnelStatus::Offline.as_str()))
        .filter(tunnel::Column::IsPersistent.eq(true))
        .all(db)
        .await?
        .into_iter()
        .filter_map(|t| t.remote_port.map(|p| (p as u16, t.id)))
        .collect();

    info!(
        reservations = reserved.len(),
        range = format!("{port_start}-{port_end}"),
        "Port pool rehydrated"
    );
    Ok(PortPool::rehydrate(port_start, port_end, &reserved))
}
