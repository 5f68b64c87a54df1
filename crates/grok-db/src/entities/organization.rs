//! Organization entity
//!
//! An organization's `subdomain` suffixes every org-scoped tunnel subdomain:
//! a client-chosen `x` in organization `o` is exposed as `x-o`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "organizations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    #[sea_orm(unique)]
    pub subdomain: String,

    pub is_active: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user::Entity")]
    Users,

    #[sea_orm(has_many = "super::webhook_app::Entity")]
    WebhookApps,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl Related<super::webhook_app::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WebhookApps.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
