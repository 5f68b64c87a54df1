//! WebhookRoute entity, binding a webhook app to one delivery tunnel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_routes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub webhook_app_id: Uuid,

    pub tunnel_id: Uuid,

    /// Lower numbers are preferred when aggregating responses
    pub priority: i32,

    pub is_enabled: bool,

    /// One of "healthy", "unhealthy", "unknown"
    pub health_status: String,

    /// Consecutive failures since the last success
    pub failure_count: i32,

    pub last_health_check: Option<ChronoDateTimeUtc>,

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

    #[sea_orm(
        belongs_to = "super::tunnel::Entity",
        from = "Column::TunnelId",
        to = "super::tunnel::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Tunnel,
}

impl Related<super::webhook_app::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::App.def()
    }
}

impl Related<super::tunnel::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tunnel.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
