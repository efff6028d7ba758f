//! Shared fixtures for the in-crate tests: an in-memory sqlite database with
//! migrations applied, a sealer with a fixed key, and wired-up app state.

use crate::app_state::{AppState, CookieSettings, OAuthConfig};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use inkauth_core::sealer::Sealer;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use std::sync::Arc;

pub async fn test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("connect to in-memory sqlite");
    Migrator::up(&db, None).await.expect("run migrations");
    db
}

pub fn test_sealer() -> Sealer {
    Sealer::new(&STANDARD.encode([7u8; 32])).expect("construct sealer")
}

pub async fn test_state() -> Arc<AppState> {
    Arc::new(AppState {
        db: test_db().await,
        sealer: test_sealer(),
        http: reqwest::Client::new(),
        pds_base: "https://bsky.social".to_string(),
        session_ttl: chrono::Duration::days(30),
        cookie: CookieSettings {
            domain: None,
            secure: None,
        },
        oauth: OAuthConfig {
            google_client_id: None,
            google_client_secret: None,
            github_client_id: None,
            github_client_secret: None,
            redirect_base: "http://localhost:8080".to_string(),
        },
        oauth_success_redirect: "http://localhost:3000/".to_string(),
        admin_token: None,
    })
}
