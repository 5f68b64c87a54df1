//! WebhookEvent entity, one row per inbound webhook delivery

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub webhook_app_id: Uuid,

    pub request_path: String,

    pub method: String,

    /// Status returned to the public caller
    pub status_code: i32,

    pub duration_ms: i64,

    pub bytes_in: i64,

    pub bytes_out: i64,

    pub client_ip: String,

    /// One of "success", "partial", "failed"
    pub routing_status: String,

    pub tunnel_count: i32,

    pub success_count: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    /// JSON-encoded request headers
    #[sea_orm(column_type = "Text")]
    pub request_headers: String,

    /// Base64 request body, capped at the capture limit
    #[sea_orm(column_type = "Text", nullable)]
    pub request_body: Option<String>,

    pub body_truncated: bool,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::webhook_app::Entity",
        from = "Column::WebhookAppId",
        to = "super::webhook_app::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    App,

    #[sea_orm(has_many = "super::webhook_tunnel_response::Entity")]
    TunnelResponses,
}

impl Related<super::webhook_app::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl Related<super::webhook_tunnel_response::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelResponses.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
