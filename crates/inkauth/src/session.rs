//! Session resolution: cookie token in, decrypted credential bundle out.

use actix_web::HttpRequest;
use chrono::{DateTime, Utc};
use entity::account::ProviderMetadata;
use entity::user;
use inkauth_core::provider::Provider;
use sea_orm::{DbErr, EntityTrait};
use std::fmt;
use std::str::FromStr;

use crate::app_state::AppState;
use crate::store;

/// Name of the session cookie issued at login.
pub const SESSION_COOKIE: &str = "ink_sid";

/// Everything a request handler needs about the caller, resolved once.
#[derive(Debug, Clone)]
pub struct SessionBundle {
    pub session_token: String,
    pub user: user::Model,
    /// Primary linked account with plaintext credentials, when one exists.
    pub account: Option<AccountCredentials>,
}

#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub provider: Provider,
    pub provider_account_id: String,
    /// `None` when the stored ciphertext no longer decrypts (key rotation,
    /// corrupt row). The session itself stays valid.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: ProviderMetadata,
    pub needs_reauth: bool,
}

#[derive(Debug)]
pub enum ResolveError {
    /// No cookie, unknown token, or the backing user is gone.
    NoSession,
    /// The token matched a row past its expiry; the row has been deleted.
    SessionExpired,
    Db(DbErr),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::NoSession => write!(f, "no session"),
            ResolveError::SessionExpired => write!(f, "session expired"),
            ResolveError::Db(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for ResolveError {}

impl From<DbErr> for ResolveError {
    fn from(err: DbErr) -> Self {
        ResolveError::Db(err)
    }
}

/// Resolve a raw session token to a bundle.
///
/// Expired rows are deleted on sight so the table does not accumulate dead
/// sessions. Decryption failures on the linked account degrade the bundle
/// (token fields become `None`) instead of failing resolution.
pub async fn resolve_session_token(
    state: &AppState,
    token: &str,
) -> Result<SessionBundle, ResolveError> {
    let Some(session) = store::find_session(&state.db, token).await? else {
        return Err(ResolveError::NoSession);
    };

    if session.expires_at <= Utc::now() {
        store::delete_session(&state.db, token).await?;
        return Err(ResolveError::SessionExpired);
    }

    let Some(user) = user::Entity::find_by_id(&session.user_id)
        .one(&state.db)
        .await
        .map_err(ResolveError::Db)?
    else {
        // Orphaned session, the user row was removed.
        store::delete_session(&state.db, token).await?;
        return Err(ResolveError::NoSession);
    };

    let account = match store::find_account_for_user(&state.db, &user.id).await? {
        Some(row) => {
            let provider = Provider::from_str(&row.provider).map_err(|_| {
                ResolveError::Db(DbErr::Custom(format!(
                    "account {} has unknown provider {:?}",
                    row.id, row.provider
                )))
            })?;

            let access_token = match state.sealer.open_b64(&row.access_token_enc) {
                Ok(token) => Some(token),
                Err(err) => {
                    log::warn!(
                        "account {}: access token ciphertext unreadable: {err}",
                        row.id
                    );
                    None
                }
            };
            let refresh_token = if row.refresh_token_enc.is_empty() {
                None
            } else {
                match state.sealer.open_b64(&row.refresh_token_enc) {
                    Ok(token) => Some(token),
                    Err(err) => {
                        log::warn!(
                            "account {}: refresh token ciphertext unreadable: {err}",
                            row.id
                        );
                        None
                    }
                }
            };

            Some(AccountCredentials {
                provider,
                provider_account_id: row.provider_account_id,
                access_token,
                refresh_token,
                expires_at: row.expires_at,
                needs_reauth: row.provider_data.refresh.needs_reauth,
                metadata: row.provider_data.metadata,
            })
        }
        None => None,
    };

    if let Err(err) = store::touch_last_seen(&state.db, token).await {
        log::debug!("touch last_seen failed for session: {err}");
    }

    Ok(SessionBundle {
        session_token: token.to_string(),
        user,
        account,
    })
}

/// Resolve the session from the request's `ink_sid` cookie.
pub async fn resolve_session(
    state: &AppState,
    req: &HttpRequest,
) -> Result<SessionBundle, ResolveError> {
    let Some(cookie) = req.cookie(SESSION_COOKIE) else {
        return Err(ResolveError::NoSession);
    };
    resolve_session_token(state, cookie.value()).await
}

/// Like [`resolve_session`] but treats a missing or expired session as an
/// anonymous caller instead of an error.
pub async fn optional_session(
    state: &AppState,
    req: &HttpRequest,
) -> Result<Option<SessionBundle>, DbErr> {
    match resolve_session(state, req).await {
        Ok(bundle) => Ok(Some(bundle)),
        Err(ResolveError::NoSession | ResolveError::SessionExpired) => Ok(None),
        Err(ResolveError::Db(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{self, NewLogin, UserProfile};
    use crate::test_util::test_state;
    use chrono::Duration;
    use entity::session;

    async fn seed_user_with_account(state: &AppState) -> user::Model {
        let user = store::find_or_create_user(
            &state.db,
            Provider::Bluesky,
            "did:plc:alice",
            &UserProfile {
                name: "alice.bsky.social",
                username: "alice.bsky.social",
                email: None,
                avatar_url: None,
            },
        )
        .await
        .unwrap();

        store::upsert_account(
            &state.db,
            &user.id,
            NewLogin {
                provider: Provider::Bluesky,
                provider_account_id: "did:plc:alice".to_string(),
                access_token_enc: state.sealer.seal_b64("access-jwt").unwrap(),
                refresh_token_enc: state.sealer.seal_b64("refresh-jwt").unwrap(),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                metadata: ProviderMetadata::Bluesky {
                    handle: "alice.bsky.social".to_string(),
                    pds_base: "https://bsky.social".to_string(),
                },
            },
        )
        .await
        .unwrap();

        user
    }

    #[tokio::test]
    async fn valid_session_resolves_to_decrypted_bundle() {
        let state = test_state().await;
        let user = seed_user_with_account(&state).await;
        let session = store::create_session(&state.db, &user.id, state.session_ttl)
            .await
            .unwrap();

        let bundle = resolve_session_token(&state, &session.session_token)
            .await
            .unwrap();
        assert_eq!(bundle.user.id, user.id);
        let account = bundle.account.unwrap();
        assert_eq!(account.provider, Provider::Bluesky);
        assert_eq!(account.access_token.as_deref(), Some("access-jwt"));
        assert_eq!(account.refresh_token.as_deref(), Some("refresh-jwt"));
        assert!(!account.needs_reauth);
    }

    #[tokio::test]
    async fn unknown_token_is_no_session() {
        let state = test_state().await;
        match resolve_session_token(&state, "not-a-token").await {
            Err(ResolveError::NoSession) => {}
            other => panic!("expected NoSession, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_session_is_deleted_then_gone() {
        let state = test_state().await;
        let user = seed_user_with_account(&state).await;
        let session = store::create_session(&state.db, &user.id, Duration::seconds(-1))
            .await
            .unwrap();

        match resolve_session_token(&state, &session.session_token).await {
            Err(ResolveError::SessionExpired) => {}
            other => panic!("expected SessionExpired, got {other:?}"),
        }

        // The row was removed, so a second attempt no longer finds it.
        assert!(session::Entity::find_by_id(&session.session_token)
            .one(&state.db)
            .await
            .unwrap()
            .is_none());
        match resolve_session_token(&state, &session.session_token).await {
            Err(ResolveError::NoSession) => {}
            other => panic!("expected NoSession, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecryptable_tokens_degrade_to_none() {
        let state = test_state().await;
        let user = seed_user_with_account(&state).await;

        // Overwrite the ciphertexts with garbage under a different key.
        let other = inkauth_core::sealer::Sealer::new(
            &base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [9u8; 32]),
        )
        .unwrap();
        store::upsert_account(
            &state.db,
            &user.id,
            NewLogin {
                provider: Provider::Bluesky,
                provider_account_id: "did:plc:alice".to_string(),
                access_token_enc: other.seal_b64("access-jwt").unwrap(),
                refresh_token_enc: other.seal_b64("refresh-jwt").unwrap(),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                metadata: ProviderMetadata::Bluesky {
                    handle: "alice.bsky.social".to_string(),
                    pds_base: "https://bsky.social".to_string(),
                },
            },
        )
        .await
        .unwrap();

        let session = store::create_session(&state.db, &user.id, state.session_ttl)
            .await
            .unwrap();
        let bundle = resolve_session_token(&state, &session.session_token)
            .await
            .unwrap();
        let account = bundle.account.unwrap();
        assert_eq!(account.access_token, None);
        assert_eq!(account.refresh_token, None);
        assert_eq!(account.provider_account_id, "did:plc:alice");
    }

    #[tokio::test]
    async fn missing_cookie_is_no_session() {
        let state = test_state().await;
        let user = seed_user_with_account(&state).await;
        store::create_session(&state.db, &user.id, state.session_ttl)
            .await
            .unwrap();

        let bare = actix_web::test::TestRequest::default().to_http_request();
        match resolve_session(&state, &bare).await {
            Err(ResolveError::NoSession) => {}
            other => panic!("expected NoSession, got {other:?}"),
        }
        assert!(optional_session(&state, &bare).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ink_sid_cookie_resolves_the_session() {
        let state = test_state().await;
        let user = seed_user_with_account(&state).await;
        let session = store::create_session(&state.db, &user.id, state.session_ttl)
            .await
            .unwrap();

        let req = actix_web::test::TestRequest::default()
            .cookie(actix_web::cookie::Cookie::new(
                SESSION_COOKIE,
                session.session_token.clone(),
            ))
            .to_http_request();

        let bundle = resolve_session(&state, &req).await.unwrap();
        assert_eq!(bundle.user.id, user.id);
        assert_eq!(bundle.session_token, session.session_token);
        assert_eq!(
            bundle.account.unwrap().access_token.as_deref(),
            Some("access-jwt")
        );
        assert!(optional_session(&state, &req).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bluesky_account_is_preferred() {
        let state = test_state().await;
        let user = seed_user_with_account(&state).await;
        store::upsert_account(
            &state.db,
            &user.id,
            NewLogin {
                provider: Provider::Github,
                provider_account_id: "gh-1".to_string(),
                access_token_enc: state.sealer.seal_b64("gh-access").unwrap(),
                refresh_token_enc: String::new(),
                expires_at: None,
                metadata: ProviderMetadata::Github {
                    login: "alice".to_string(),
                    name: None,
                    avatar_url: None,
                },
            },
        )
        .await
        .unwrap();

        let session = store::create_session(&state.db, &user.id, state.session_ttl)
            .await
            .unwrap();
        let bundle = resolve_session_token(&state, &session.session_token)
            .await
            .unwrap();
        assert_eq!(bundle.account.unwrap().provider, Provider::Bluesky);
    }
}
