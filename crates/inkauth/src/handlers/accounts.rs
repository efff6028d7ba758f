use actix_web::{web, HttpRequest, HttpResponse, Responder};
use inkauth_core::provider::Provider;
use std::str::FromStr;

use crate::app_state::AppState;
use crate::models::*;
use crate::store::{self, UnlinkOutcome};

/// GET /api/auth/accounts
pub async fn list(app_state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let bundle = match super::require_session(&app_state, &req).await {
        Ok(bundle) => bundle,
        Err(response) => return response,
    };

    let rows = match store::list_accounts(&app_state.db, &bundle.user.id).await {
        Ok(rows) => rows,
        Err(err) => {
            log::error!("listing accounts failed: {err}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "internal_error".to_string(),
                message: "Database error occurred".to_string(),
            });
        }
    };

    let accounts: Vec<AccountInfo> = rows
        .into_iter()
        .map(|row| AccountInfo {
            provider: row.provider,
            provider_account_id: row.provider_account_id,
            expires_at: row.expires_at,
            needs_reauth: row.provider_data.refresh.needs_reauth,
            metadata: row.provider_data.metadata,
        })
        .collect();

    HttpResponse::Ok().json(accounts)
}

/// POST /api/auth/unlink
pub async fn unlink(
    app_state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Json<UnlinkPayload>,
) -> impl Responder {
    let bundle = match super::require_session(&app_state, &req).await {
        Ok(bundle) => bundle,
        Err(response) => return response,
    };

    let provider = match Provider::from_str(&payload.provider) {
        Ok(provider) => provider,
        Err(_) => {
            return HttpResponse::BadRequest().json(ErrorResponse {
                error: "unknown_provider".to_string(),
                message: format!("No such provider: {}", payload.provider),
            });
        }
    };

    match store::unlink_account(&app_state.db, &bundle.user.id, provider).await {
        Ok(UnlinkOutcome::Unlinked) => HttpResponse::Ok().json(serde_json::json!({ "ok": true })),
        Ok(UnlinkOutcome::LastProvider) => HttpResponse::Conflict().json(ErrorResponse {
            error: "last_provider".to_string(),
            message: "Cannot unlink the only sign-in method".to_string(),
        }),
        Ok(UnlinkOutcome::NotLinked) => HttpResponse::NotFound().json(ErrorResponse {
            error: "not_linked".to_string(),
            message: format!("No {provider} account is linked"),
        }),
        Err(err) => {
            log::error!("unlink failed: {err}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "internal_error".to_string(),
                message: "Database error occurred".to_string(),
            })
        }
    }
}
