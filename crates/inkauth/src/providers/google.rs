//! Google OAuth2 adapter: token endpoint for code exchange and refresh,
//! OpenID userinfo for the profile.

use async_trait::async_trait;
use inkauth_core::provider::{
    parse_oauth_refresh_body, Provider, RefreshError, RefreshedCredential,
};
use serde::Deserialize;

use super::ProviderAdapter;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

pub struct GoogleAdapter {
    client_id: String,
    client_secret: String,
}

impl GoogleAdapter {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn refresh(
        &self,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<RefreshedCredential, RefreshError> {
        let response = http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        parse_oauth_refresh_body(&body)
    }
}

/// URL the browser is redirected to at the start of the OAuth flow.
/// `access_type=offline` + `prompt=consent` are what make Google return a
/// refresh token.
pub fn authorize_url(client_id: &str, redirect_uri: &str, state: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode("openid email profile"),
        urlencoding::encode(state),
    )
}

pub async fn exchange_code(
    http: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<RefreshedCredential, RefreshError> {
    let response = http
        .post(TOKEN_URL)
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    let body = response
        .text()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;
    parse_oauth_refresh_body(&body)
}

#[derive(Debug, Deserialize)]
pub struct GoogleProfile {
    /// Stable subject identifier, used as the provider account id.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

pub async fn fetch_profile(
    http: &reqwest::Client,
    access_token: &str,
) -> Result<GoogleProfile, RefreshError> {
    let response = http
        .get(USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !response.status().is_success() {
        return Err(RefreshError::BadResponse(format!(
            "userinfo returned {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| RefreshError::BadResponse(format!("userinfo body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_requests_offline_access() {
        let url = authorize_url("cid", "http://localhost:8080/cb", "xyz");
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=xyz"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcb"));
    }
}
