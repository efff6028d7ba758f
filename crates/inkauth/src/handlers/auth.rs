use actix_web::cookie::{Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use inkauth_core::provider::{Provider, RefreshError};
use std::str::FromStr;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::*;
use crate::providers::{bluesky, github, google};
use crate::session;
use crate::store::{self, NewLogin, UserProfile};

use entity::account::ProviderMetadata;

/// Short-lived cookie carrying the CSRF state between /start and /callback.
const OAUTH_STATE_COOKIE: &str = "oauth_state";

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorResponse {
        error: "internal_error".to_string(),
        message: "Database error occurred".to_string(),
    })
}

/// POST /api/auth/login
/// App-password login against the user's PDS.
pub async fn bsky_login(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Json<LoginPayload>,
) -> impl Responder {
    let pds_base = payload
        .pds_base
        .as_deref()
        .unwrap_or(&app_state.pds_base)
        .to_string();

    let pds_session = match bluesky::create_session(
        &app_state.http,
        &pds_base,
        &payload.identifier,
        &payload.app_password,
    )
    .await
    {
        Ok(session) => session,
        Err(RefreshError::Provider { error, description }) => {
            return HttpResponse::Unauthorized().json(ErrorResponse {
                error: "invalid_credentials".to_string(),
                message: description.unwrap_or(error),
            });
        }
        Err(err) => {
            log::error!("createSession against {pds_base} failed: {err}");
            return HttpResponse::BadGateway().json(ErrorResponse {
                error: "upstream_error".to_string(),
                message: "Could not reach the PDS".to_string(),
            });
        }
    };

    let (access_enc, refresh_enc) = match (
        app_state.sealer.seal_b64(&pds_session.access_jwt),
        app_state.sealer.seal_b64(&pds_session.refresh_jwt),
    ) {
        (Ok(a), Ok(r)) => (a, r),
        (Err(err), _) | (_, Err(err)) => {
            log::error!("sealing PDS tokens failed: {err}");
            return internal_error();
        }
    };

    let user = match store::find_or_create_user(
        &app_state.db,
        Provider::Bluesky,
        &pds_session.did,
        &UserProfile {
            name: &pds_session.handle,
            username: &pds_session.handle,
            email: None,
            avatar_url: None,
        },
    )
    .await
    {
        Ok(user) => user,
        Err(err) => {
            log::error!("find_or_create_user failed: {err}");
            return internal_error();
        }
    };

    if let Err(err) = store::upsert_account(
        &app_state.db,
        &user.id,
        NewLogin {
            provider: Provider::Bluesky,
            provider_account_id: pds_session.did.clone(),
            access_token_enc: access_enc,
            refresh_token_enc: refresh_enc,
            expires_at: Some(pds_session.expires_at),
            metadata: ProviderMetadata::Bluesky {
                handle: pds_session.handle.clone(),
                pds_base,
            },
        },
    )
    .await
    {
        log::error!("upsert_account failed: {err}");
        return internal_error();
    }

    let session = match store::create_session(&app_state.db, &user.id, app_state.session_ttl).await
    {
        Ok(session) => session,
        Err(err) => {
            log::error!("create_session failed: {err}");
            return internal_error();
        }
    };

    HttpResponse::Ok()
        .cookie(super::session_cookie(
            &app_state,
            &req,
            session.session_token,
        ))
        .json(LoginResponse {
            user_id: user.id,
            handle: pds_session.handle,
            did: pds_session.did,
        })
}

/// POST /api/auth/logout
/// Always succeeds; the session row is removed when the cookie is valid.
pub async fn logout(app_state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if let Some(cookie) = req.cookie(session::SESSION_COOKIE) {
        if let Err(err) = store::delete_session(&app_state.db, cookie.value()).await {
            log::warn!("deleting session on logout failed: {err}");
        }
    }

    HttpResponse::Ok()
        .cookie(super::clear_session_cookie(&app_state, &req))
        .json(serde_json::json!({ "ok": true }))
}

/// GET /api/auth/me
pub async fn me(app_state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let bundle = match super::require_session(&app_state, &req).await {
        Ok(bundle) => bundle,
        Err(response) => return response,
    };

    let accounts = match store::list_accounts(&app_state.db, &bundle.user.id).await {
        Ok(rows) => rows,
        Err(err) => {
            log::error!("listing accounts failed: {err}");
            return internal_error();
        }
    };

    HttpResponse::Ok().json(MeResponse {
        user_id: bundle.user.id,
        name: bundle.user.name,
        username: bundle.user.username,
        email: bundle.user.email,
        avatar_url: bundle.user.avatar_url,
        accounts: accounts
            .into_iter()
            .map(|row| AccountInfo {
                provider: row.provider,
                provider_account_id: row.provider_account_id,
                expires_at: row.expires_at,
                needs_reauth: row.provider_data.refresh.needs_reauth,
                metadata: row.provider_data.metadata,
            })
            .collect(),
    })
}

fn oauth_provider(app_state: &AppState, raw: &str) -> Result<Provider, HttpResponse> {
    let provider = Provider::from_str(raw).map_err(|_| {
        HttpResponse::NotFound().json(ErrorResponse {
            error: "unknown_provider".to_string(),
            message: format!("No such provider: {raw}"),
        })
    })?;

    let configured = match provider {
        Provider::Google => app_state.oauth.google_configured(),
        Provider::Github => app_state.oauth.github_configured(),
        // Bluesky uses app-password login, not an OAuth redirect flow.
        Provider::Bluesky => false,
    };
    if !configured {
        return Err(HttpResponse::NotFound().json(ErrorResponse {
            error: "provider_not_configured".to_string(),
            message: format!("OAuth is not configured for {provider}"),
        }));
    }

    Ok(provider)
}

fn oauth_state_cookie(
    app_state: &AppState,
    req: &HttpRequest,
    value: String,
    ttl_minutes: i64,
) -> Cookie<'static> {
    Cookie::build(OAUTH_STATE_COOKIE, value)
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(super::want_secure(app_state, req))
        .max_age(actix_web::cookie::time::Duration::minutes(ttl_minutes))
        .finish()
}

/// GET /api/auth/oauth/{provider}/start
/// Issues the CSRF state cookie and redirects to the provider's consent page.
pub async fn oauth_start(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    let provider = match oauth_provider(&app_state, &path) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    let state_token = Uuid::new_v4().to_string();
    let redirect_uri = app_state.oauth.redirect_uri(provider);

    let url = match provider {
        Provider::Google => google::authorize_url(
            app_state.oauth.google_client_id.as_deref().unwrap_or(""),
            &redirect_uri,
            &state_token,
        ),
        Provider::Github => github::authorize_url(
            app_state.oauth.github_client_id.as_deref().unwrap_or(""),
            &redirect_uri,
            &state_token,
        ),
        Provider::Bluesky => unreachable!("filtered by oauth_provider"),
    };

    HttpResponse::Found()
        .cookie(oauth_state_cookie(
            &app_state,
            &req,
            format!("{provider}|{state_token}"),
            10,
        ))
        .insert_header(("Location", url))
        .finish()
}

#[derive(Debug, serde::Deserialize)]
pub struct OAuthCallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// GET /api/auth/oauth/{provider}/callback
pub async fn oauth_callback(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<OAuthCallbackQuery>,
) -> impl Responder {
    let provider = match oauth_provider(&app_state, &path) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    if let Some(error) = &query.error {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "oauth_denied".to_string(),
            message: format!("Provider returned: {error}"),
        });
    }

    // The state cookie must exist and match {provider}|{state}.
    let state_ok = matches!(
        (req.cookie(OAUTH_STATE_COOKIE), &query.state),
        (Some(cookie), Some(state)) if cookie.value() == format!("{provider}|{state}")
    );
    if !state_ok {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "state_mismatch".to_string(),
            message: "OAuth state did not match, restart the sign-in flow".to_string(),
        });
    }

    let Some(code) = &query.code else {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "missing_code".to_string(),
            message: "Callback had no authorization code".to_string(),
        });
    };

    let redirect_uri = app_state.oauth.redirect_uri(provider);
    let exchanged = match provider {
        Provider::Google => {
            google::exchange_code(
                &app_state.http,
                app_state.oauth.google_client_id.as_deref().unwrap_or(""),
                app_state.oauth.google_client_secret.as_deref().unwrap_or(""),
                code,
                &redirect_uri,
            )
            .await
        }
        Provider::Github => {
            github::exchange_code(
                &app_state.http,
                app_state.oauth.github_client_id.as_deref().unwrap_or(""),
                app_state.oauth.github_client_secret.as_deref().unwrap_or(""),
                code,
                &redirect_uri,
            )
            .await
        }
        Provider::Bluesky => unreachable!("filtered by oauth_provider"),
    };
    let cred = match exchanged {
        Ok(cred) => cred,
        Err(RefreshError::Provider { error, description }) => {
            return HttpResponse::BadRequest().json(ErrorResponse {
                error: "oauth_exchange_failed".to_string(),
                message: description.unwrap_or(error),
            });
        }
        Err(err) => {
            log::error!("{provider} code exchange failed: {err}");
            return HttpResponse::BadGateway().json(ErrorResponse {
                error: "upstream_error".to_string(),
                message: "Token exchange with the provider failed".to_string(),
            });
        }
    };

    // Provider identity and profile.
    let (provider_account_id, profile_name, profile_username, email, avatar_url, metadata) =
        match provider {
            Provider::Google => {
                match google::fetch_profile(&app_state.http, &cred.access_token).await {
                    Ok(profile) => {
                        let name = profile
                            .name
                            .clone()
                            .or_else(|| profile.email.clone())
                            .unwrap_or_else(|| profile.sub.clone());
                        (
                            profile.sub.clone(),
                            name.clone(),
                            profile.email.clone().unwrap_or(name),
                            profile.email.clone(),
                            profile.picture.clone(),
                            ProviderMetadata::Google {
                                email: profile.email,
                                name: profile.name,
                                avatar_url: profile.picture,
                            },
                        )
                    }
                    Err(err) => {
                        log::error!("google profile fetch failed: {err}");
                        return HttpResponse::BadGateway().json(ErrorResponse {
                            error: "upstream_error".to_string(),
                            message: "Fetching the provider profile failed".to_string(),
                        });
                    }
                }
            }
            Provider::Github => {
                match github::fetch_profile(&app_state.http, &cred.access_token).await {
                    Ok(profile) => {
                        let name = profile.name.clone().unwrap_or_else(|| profile.login.clone());
                        (
                            profile.id.to_string(),
                            name,
                            profile.login.clone(),
                            profile.email.clone(),
                            profile.avatar_url.clone(),
                            ProviderMetadata::Github {
                                login: profile.login,
                                name: profile.name,
                                avatar_url: profile.avatar_url,
                            },
                        )
                    }
                    Err(err) => {
                        log::error!("github profile fetch failed: {err}");
                        return HttpResponse::BadGateway().json(ErrorResponse {
                            error: "upstream_error".to_string(),
                            message: "Fetching the provider profile failed".to_string(),
                        });
                    }
                }
            }
            Provider::Bluesky => unreachable!("filtered by oauth_provider"),
        };

    // Signed-in callers link the provider to their existing user; anonymous
    // callers resolve or create one.
    let existing = match session::optional_session(&app_state, &req).await {
        Ok(existing) => existing,
        Err(err) => {
            log::error!("session lookup during callback failed: {err}");
            return internal_error();
        }
    };
    let user = match &existing {
        Some(bundle) => bundle.user.clone(),
        None => {
            match store::find_or_create_user(
                &app_state.db,
                provider,
                &provider_account_id,
                &UserProfile {
                    name: &profile_name,
                    username: &profile_username,
                    email: email.as_deref(),
                    avatar_url: avatar_url.as_deref(),
                },
            )
            .await
            {
                Ok(user) => user,
                Err(err) => {
                    log::error!("find_or_create_user failed: {err}");
                    return internal_error();
                }
            }
        }
    };

    let access_enc = match app_state.sealer.seal_b64(&cred.access_token) {
        Ok(enc) => enc,
        Err(err) => {
            log::error!("sealing access token failed: {err}");
            return internal_error();
        }
    };
    let refresh_enc = match &cred.refresh_token {
        Some(token) => match app_state.sealer.seal_b64(token) {
            Ok(enc) => enc,
            Err(err) => {
                log::error!("sealing refresh token failed: {err}");
                return internal_error();
            }
        },
        // Providers without rotation get no refresh credential stored.
        None => String::new(),
    };

    if let Err(err) = store::upsert_account(
        &app_state.db,
        &user.id,
        NewLogin {
            provider,
            provider_account_id,
            access_token_enc: access_enc,
            refresh_token_enc: refresh_enc,
            expires_at: cred.expires_at,
            metadata,
        },
    )
    .await
    {
        log::error!("upsert_account failed: {err}");
        return internal_error();
    }

    let mut response = HttpResponse::Found();
    response
        .cookie(oauth_state_cookie(&app_state, &req, String::new(), 0))
        .insert_header(("Location", app_state.oauth_success_redirect.clone()));

    if existing.is_none() {
        let session =
            match store::create_session(&app_state.db, &user.id, app_state.session_ttl).await {
                Ok(session) => session,
                Err(err) => {
                    log::error!("create_session failed: {err}");
                    return internal_error();
                }
            };
        response.cookie(super::session_cookie(&app_state, &req, session.session_token));
    }

    response.finish()
}
