use inkauth_core::provider::Provider;
use inkauth_core::sealer::Sealer;
use sea_orm::DatabaseConnection;

/// Shared application state
pub struct AppState {
    /// Sea-ORM database connection pool
    pub db: DatabaseConnection,

    /// Authenticated-encryption primitive for tokens at rest
    pub sealer: Sealer,

    /// Shared HTTP client for provider calls
    pub http: reqwest::Client,

    /// Default Bluesky PDS base URL
    pub pds_base: String,

    /// Session lifetime applied at login
    pub session_ttl: chrono::Duration,

    /// Session cookie attributes
    pub cookie: CookieSettings,

    /// OAuth provider configuration
    pub oauth: OAuthConfig,

    /// Where the browser lands after a successful OAuth callback
    pub oauth_success_redirect: String,

    /// Shared secret for the admin surface; `None` disables it
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CookieSettings {
    /// Cookie Domain attribute; host-only when unset
    pub domain: Option<String>,

    /// Forced Secure attribute; inferred per request when unset
    pub secure: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct OAuthConfig {
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,

    /// Externally reachable base URL used to build redirect URIs
    pub redirect_base: String,
}

impl OAuthConfig {
    pub fn google_configured(&self) -> bool {
        self.google_client_id.is_some() && self.google_client_secret.is_some()
    }

    pub fn github_configured(&self) -> bool {
        self.github_client_id.is_some() && self.github_client_secret.is_some()
    }

    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!(
            "{}/api/auth/oauth/{}/callback",
            self.redirect_base.trim_end_matches('/'),
            provider
        )
    }
}
