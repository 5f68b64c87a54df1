//! Tunnel entity
//!
//! Rows persist across client disconnects so persistent tunnels can reclaim
//! their identity (and TCP port) on reconnect.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    pub token_id: Uuid,

    pub organization_id: Option<Uuid>,

    /// One of "http", "https", "tcp", "tls"
    pub tunnel_type: String,

    /// Full composed subdomain; empty for TCP tunnels
    pub subdomain: String,

    /// Public port for TCP tunnels, unique while active or reserved
    pub remote_port: Option<i32>,

    /// Address of the client's local service
    pub local_addr: String,

    pub public_url: String,

    /// Client connection identity, unique across tunnels
    #[sea_orm(unique)]
    pub client_id: String,

    /// Stable per-user name for reconnection
    #[sea_orm(nullable)]
    pub saved_name: Option<String>,

    pub is_persistent: bool,

    /// One of "active", "offline", "disconnected"
    pub status: String,

    pub bytes_in: i64,

    pub bytes_out: i64,

    pub requests_count: i64,

    pub connected_at: ChronoDateTimeUtc,

    pub disconnected_at: Option<ChronoDateTimeUtc>,

    pub last_activity_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,

    #[sea_orm(
        belongs_to = "super::auth_token::Entity",
        from = "Column::TokenId",
        to = "super::auth_token::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Token,

    #[sea_orm(has_many = "super::request_log::Entity")]
    RequestLogs,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::request_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RequestLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
