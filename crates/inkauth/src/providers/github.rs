//! GitHub OAuth adapter. GitHub only issues refresh tokens for apps with
//! token expiration enabled; classic OAuth apps return a non-expiring access
//! token and no refresh credential.

use async_trait::async_trait;
use inkauth_core::provider::{
    parse_oauth_refresh_body, Provider, RefreshError, RefreshedCredential,
};
use serde::Deserialize;

use super::ProviderAdapter;

const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const USER_URL: &str = "https://api.github.com/user";

pub struct GithubAdapter {
    client_id: String,
    client_secret: String,
}

impl GithubAdapter {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GithubAdapter {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    async fn refresh(
        &self,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<RefreshedCredential, RefreshError> {
        let response = http
            .post(TOKEN_URL)
            .header(reqwest::header::ACCEPT, "application/json")
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

pub fn authorize_url(client_id: &str, redirect_uri: &str, state: &str) -> String {
    format!(
        "{AUTHORIZE_URL}?client_id={}&redirect_uri={}&scope={}&state={}",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode("read:user user:email"),
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
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
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
pub struct GithubProfile {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

pub async fn fetch_profile(
    http: &reqwest::Client,
    access_token: &str,
) -> Result<GithubProfile, RefreshError> {
    // The GitHub API rejects requests without a User-Agent.
    let response = http
        .get(USER_URL)
        .bearer_auth(access_token)
        .header(reqwest::header::USER_AGENT, "inkauth")
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .send()
        .await
        .map_err(|e| RefreshError::Transport(e.to_string()))?;

    if !response.status().is_success() {
        return Err(RefreshError::BadResponse(format!(
            "user endpoint returned {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| RefreshError::BadResponse(format!("user body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_state_and_scope() {
        let url = authorize_url("cid", "http://localhost:8080/cb", "abc");
        assert!(url.starts_with(AUTHORIZE_URL));
        assert!(url.contains("state=abc"));
        assert!(url.contains("scope=read%3Auser%20user%3Aemail"));
    }
}
