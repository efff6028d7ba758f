pub mod accounts;
pub mod admin;
pub mod auth;

use actix_web::cookie::{Cookie, SameSite};
use actix_web::{HttpRequest, HttpResponse};

use crate::app_state::AppState;
use crate::models::ErrorResponse;
use crate::session::{self, ResolveError, SessionBundle, SESSION_COOKIE};

/// Secure flag: explicit config wins, otherwise inferred from the request's
/// effective scheme (honors Forwarded/X-Forwarded-Proto behind a proxy) so
/// local http development still gets a usable cookie.
pub(crate) fn want_secure(state: &AppState, req: &HttpRequest) -> bool {
    state
        .cookie
        .secure
        .unwrap_or_else(|| req.connection_info().scheme() == "https")
}

pub(crate) fn session_cookie(
    state: &AppState,
    req: &HttpRequest,
    token: String,
) -> Cookie<'static> {
    let mut builder = Cookie::build(SESSION_COOKIE, token)
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(want_secure(state, req))
        .max_age(actix_web::cookie::time::Duration::seconds(
            state.session_ttl.num_seconds(),
        ));
    if let Some(domain) = &state.cookie.domain {
        builder = builder.domain(domain.clone());
    }
    builder.finish()
}

pub(crate) fn clear_session_cookie(state: &AppState, req: &HttpRequest) -> Cookie<'static> {
    let mut builder = Cookie::build(SESSION_COOKIE, "")
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(want_secure(state, req))
        .max_age(actix_web::cookie::time::Duration::ZERO);
    if let Some(domain) = &state.cookie.domain {
        builder = builder.domain(domain.clone());
    }
    builder.finish()
}

/// Resolve the caller's session or produce the error response to return.
pub(crate) async fn require_session(
    state: &AppState,
    req: &HttpRequest,
) -> Result<SessionBundle, HttpResponse> {
    match session::resolve_session(state, req).await {
        Ok(bundle) => Ok(bundle),
        Err(ResolveError::NoSession) => Err(HttpResponse::Unauthorized().json(ErrorResponse {
            error: "unauthorized".to_string(),
            message: "Sign in required".to_string(),
        })),
        Err(ResolveError::SessionExpired) => {
            Err(HttpResponse::Unauthorized().json(ErrorResponse {
                error: "session_expired".to_string(),
                message: "Session has expired, sign in again".to_string(),
            }))
        }
        Err(ResolveError::Db(err)) => {
            log::error!("session resolution failed: {err}");
            Err(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "internal_error".to_string(),
                message: "Database error occurred".to_string(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_state;
    use actix_web::test::TestRequest;
    use std::sync::Arc;

    #[tokio::test]
    async fn secure_flag_follows_request_scheme() {
        let state = test_state().await;

        let plain = TestRequest::default().to_http_request();
        assert!(!want_secure(&state, &plain));
        assert_eq!(
            session_cookie(&state, &plain, "tok".to_string()).secure(),
            Some(false)
        );

        // Behind a TLS-terminating proxy.
        let forwarded = TestRequest::default()
            .insert_header(("X-Forwarded-Proto", "https"))
            .to_http_request();
        assert!(want_secure(&state, &forwarded));
        assert_eq!(
            session_cookie(&state, &forwarded, "tok".to_string()).secure(),
            Some(true)
        );
        assert_eq!(
            clear_session_cookie(&state, &forwarded).secure(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn secure_flag_config_override_beats_inference() {
        let mut state = test_state().await;
        Arc::get_mut(&mut state).unwrap().cookie.secure = Some(true);

        let plain = TestRequest::default().to_http_request();
        assert!(want_secure(&state, &plain));
    }
}
