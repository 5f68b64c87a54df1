//! WebhookTunnelResponse entity, per-route outcome of one webhook delivery

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_tunnel_responses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub webhook_event_id: Uuid,

    pub tunnel_id: Uuid,

    /// Snapshot of the tunnel subdomain at delivery time
    pub tunnel_subdomain: String,

    pub status_code: Option<i32>,

    pub duration_ms: i64,

    pub success: bool,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    /// JSON-encoded response headers
    #[sea_orm(column_type = "Text")]
    pub headers: String,

    /// Base64 response body, capped at the capture limit
    #[sea_orm(column_type = "Text", nullable)]
    pub body: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::webhook_event::Entity",
        from = "Column::WebhookEventId",
        to = "super::webhook_event::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Event,
}

impl Related<super::webhook_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Event.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
