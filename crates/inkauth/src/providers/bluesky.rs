//! Bluesky (AT Protocol) adapter. Sessions come from the user's PDS via
//! `com.atproto.server.createSession` and are renewed with
//! `com.atproto.server.refreshSession`, authenticated by the refresh JWT.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inkauth_core::provider::{
    parse_active_until, parse_bsky_refresh_body, Provider, RefreshError, RefreshedCredential,
};
use serde::Deserialize;

use super::ProviderAdapter;

pub struct BlueskyAdapter {
    pds_base: String,
}

impl BlueskyAdapter {
    pub fn new(pds_base: &str) -> Self {
        Self {
            pds_base: pds_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for BlueskyAdapter {
    fn provider(&self) -> Provider {
        Provider::Bluesky
    }

    async fn refresh(
        &self,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<RefreshedCredential, RefreshError> {
        let url = format!("{}/xrpc/com.atproto.server.refreshSession", self.pds_base);
        let response = http
            .post(&url)
            .bearer_auth(refresh_token)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        parse_bsky_refresh_body(&body)
    }
}

/// A full PDS session as returned by `createSession`.
#[derive(Debug)]
pub struct BskySession {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    did: String,
    handle: String,
    access_jwt: String,
    refresh_jwt: String,
    #[serde(default)]
    active_until: Option<String>,
}

#[derive(Deserialize)]
struct PdsErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// App-password login against a PDS.
pub async fn create_session(
    http: &reqwest::Client,
    pds_base: &str,
    identifier: &str,
    app_password: &str,
) -> Result<BskySession, RefreshError> {
    let url = format!(
        "{}/xrpc/com.atproto.server.createSession",
        pds_base.trim_end_matches('/')
    );
    let response = http
        .post(&url)
        .json(&serde_json::json!({
            "identifier": identifier,
            "password": app_password,
        }))
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if status >= 400 {
        let parsed: PdsErrorBody = serde_json::from_str(&body).unwrap_or(PdsErrorBody {
            error: None,
            message: None,
        });
        return Err(RefreshError::Provider {
            error: parsed.error.unwrap_or_else(|| format!("http {status}")),
            description: parsed.message,
        });
    }

    let parsed: CreateSessionBody = serde_json::from_str(&body)
        .map_err(|e| RefreshError::BadResponse(format!("createSession body: {e}")))?;
    if parsed.access_jwt.is_empty() || parsed.refresh_jwt.is_empty() {
        return Err(RefreshError::BadResponse(
            "createSession returned empty tokens".to_string(),
        ));
    }

    Ok(BskySession {
        did: parsed.did,
        handle: parsed.handle,
        access_jwt: parsed.access_jwt,
        refresh_jwt: parsed.refresh_jwt,
        expires_at: parse_active_until(parsed.active_until.as_deref().unwrap_or("")),
    })
}
