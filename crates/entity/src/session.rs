use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    /// Opaque value stored in the browser's `ink_sid` cookie.
    #[sea_orm(primary_key, auto_increment = false)]
    pub session_token: String,

    /// Foreign key to users table
    pub user_id: String,

    /// Absolute expiry, fixed at creation and never extended by activity.
    pub expires_at: ChronoDateTimeUtc,

    pub created_at: ChronoDateTimeUtc,

    /// Best-effort, updated on each successful resolution.
    pub last_seen_at: ChronoDateTimeUtc,
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
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
