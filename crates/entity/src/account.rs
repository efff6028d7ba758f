use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Foreign key to users table
    pub user_id: String,

    /// Identity provider ("bluesky", "google", "github")
    pub provider: String,

    /// Provider-scoped stable identifier (DID for bluesky, numeric id for
    /// GitHub, `sub` for Google).
    pub provider_account_id: String,

    /// Base64 of the sealed access token blob. Empty when never issued.
    #[sea_orm(column_type = "Text")]
    pub access_token_enc: String,

    /// Base64 of the sealed refresh token blob. Empty for grants that never
    /// issued one.
    #[sea_orm(column_type = "Text")]
    pub refresh_token_enc: String,

    /// Access token validity horizon as declared by the provider. Drives the
    /// refresh scheduler's candidate query.
    pub expires_at: Option<ChronoDateTimeUtc>,

    pub provider_data: ProviderData,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

/// Provider-specific metadata plus refresh lifecycle bookkeeping, stored as
/// one JSON column but validated independently: failure-policy code only
/// touches `refresh` and never has to type-check an open map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct ProviderData {
    pub metadata: ProviderMetadata,

    #[serde(default)]
    pub refresh: RefreshState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderMetadata {
    Bluesky {
        handle: String,
        /// PDS the account lives on; refresh calls go here.
        pds_base: String,
    },
    Google {
        email: Option<String>,
        name: Option<String>,
        avatar_url: Option<String>,
    },
    Github {
        login: String,
        name: Option<String>,
        avatar_url: Option<String>,
    },
}

/// Per-account refresh state machine, encoded in `provider_data`.
///
/// Healthy: `needs_reauth == false`. Each failed refresh attempt increments
/// `fail_count`; reaching the configured threshold flips `needs_reauth`.
/// Any later success (automatic or re-login) clears everything back to the
/// default.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshState {
    #[serde(default)]
    pub fail_count: u32,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub needs_reauth: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<ChronoDateTimeUtc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<ChronoDateTimeUtc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_error: Option<String>,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_state_defaults_serialize_compactly() {
        let data = ProviderData {
            metadata: ProviderMetadata::Bluesky {
                handle: "alice.bsky.social".to_string(),
                pds_base: "https://bsky.social".to_string(),
            },
            refresh: RefreshState::default(),
        };

        let json = serde_json::to_value(&data).unwrap();
        let refresh = &json["refresh"];
        assert_eq!(refresh["fail_count"], 0);
        // Healthy accounts carry no needs_reauth key at all.
        assert!(refresh.get("needs_reauth").is_none());
        assert!(refresh.get("last_failure_error").is_none());
    }

    #[test]
    fn legacy_rows_without_refresh_state_deserialize() {
        let json = r#"{"metadata":{"kind":"github","login":"octocat","name":null,"avatar_url":null}}"#;
        let data: ProviderData = serde_json::from_str(json).unwrap();
        assert_eq!(data.refresh, RefreshState::default());
        assert!(!data.refresh.needs_reauth);
    }

    #[test]
    fn metadata_round_trips_through_tag() {
        let meta = ProviderMetadata::Google {
            email: Some("a@example.com".to_string()),
            name: None,
            avatar_url: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains(r#""kind":"google""#));
        let back: ProviderMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
