use actix_web::{web, HttpRequest, HttpResponse, Responder};

use crate::app_state::AppState;
use crate::models::*;
use crate::store;

const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";
const LISTING_LIMIT: u64 = 500;

fn authorized(app_state: &AppState, req: &HttpRequest) -> bool {
    let Some(expected) = &app_state.admin_token else {
        return false;
    };
    req.headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

/// GET /api/admin/needs-reauth
/// Operator view of accounts whose refresh has been escalated. Disabled
/// entirely unless ADMIN_TOKEN is configured.
pub async fn needs_reauth(app_state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    if app_state.admin_token.is_none() {
        return HttpResponse::NotFound().json(ErrorResponse {
            error: "not_found".to_string(),
            message: "Not found".to_string(),
        });
    }
    if !authorized(&app_state, &req) {
        return HttpResponse::Unauthorized().json(ErrorResponse {
            error: "unauthorized".to_string(),
            message: "Invalid admin token".to_string(),
        });
    }

    let rows = match store::accounts_needing_reauth(&app_state.db, LISTING_LIMIT).await {
        Ok(rows) => rows,
        Err(err) => {
            log::error!("needs-reauth listing failed: {err}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "internal_error".to_string(),
                message: "Database error occurred".to_string(),
            });
        }
    };

    let entries: Vec<NeedsReauthEntry> = rows
        .into_iter()
        .map(|(account, user)| {
            let refresh = &account.provider_data.refresh;
            NeedsReauthEntry {
                account_id: account.id,
                user_id: account.user_id,
                username: user.map(|u| u.username),
                provider: account.provider,
                provider_account_id: account.provider_account_id,
                fail_count: refresh.fail_count,
                last_failure_at: refresh.last_failure_at,
                last_failure_error: refresh.last_failure_error.clone(),
            }
        })
        .collect();

    HttpResponse::Ok().json(entries)
}
