use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "inkauth")]
#[command(about = "InkReaders credential & session service", long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
    /// Start the API server
    Serve(ServeConfig),

    /// Run database migrations
    Migrate {
        /// Database connection URL
        #[arg(
            long,
            env = "DATABASE_URL",
            default_value = "sqlite://./inkauth.db?mode=rwc"
        )]
        database_url: String,
    },
}

#[derive(Debug, Clone, Parser)]
pub struct ServeConfig {
    /// Database connection URL
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite://./inkauth.db?mode=rwc"
    )]
    pub database_url: String,

    /// Server bind address
    #[arg(long, env = "BIND_ADDRESS", default_value = "127.0.0.1:8080")]
    pub bind_address: String,

    /// Allowed CORS origins (comma-separated)
    #[arg(
        long,
        env = "CORS_ORIGINS",
        default_value = "http://localhost:3000,http://localhost:5173"
    )]
    pub cors_origins: String,

    /// Base64-encoded 32-byte key protecting provider tokens at rest.
    ///
    /// Required; the process refuses to start if it is absent or unusable.
    #[arg(long, env = "TOKEN_ENC_KEY")]
    pub token_enc_key: String,

    /// Default Bluesky PDS base URL (per-account pds_base overrides this)
    #[arg(long, env = "BLUESKY_PDS_BASE", default_value = "https://bsky.social")]
    pub pds_base: String,

    /// Session cookie lifetime in days
    #[arg(long, env = "SESSION_TTL_DAYS", default_value = "30")]
    pub session_ttl_days: i64,

    /// Cookie Domain attribute (unset: host-only cookie)
    #[arg(long, env = "COOKIE_DOMAIN")]
    pub cookie_domain: Option<String>,

    /// Force the cookie Secure attribute on or off.
    ///
    /// When unset, Secure is inferred per request: on for https, off for
    /// localhost.
    #[arg(long, env = "COOKIE_SECURE")]
    pub cookie_secure: Option<bool>,

    /// Seconds between refresh scheduler passes
    #[arg(long, env = "TOKEN_REFRESH_INTERVAL_SECS", default_value = "300")]
    pub refresh_interval_secs: u64,

    /// Lookahead window: accounts expiring within this many seconds are
    /// refresh candidates
    #[arg(long, env = "TOKEN_REFRESH_WINDOW_SECS", default_value = "600")]
    pub refresh_window_secs: u64,

    /// Consecutive failures before an account is flagged needs_reauth
    #[arg(long, env = "REFRESH_FAIL_THRESHOLD", default_value = "3")]
    pub refresh_fail_threshold: u32,

    /// Timeout for a single account's refresh attempt, in seconds
    #[arg(long, env = "REFRESH_ACCOUNT_TIMEOUT_SECS", default_value = "20")]
    pub refresh_account_timeout_secs: u64,

    /// Overall timeout for one refresh pass, in seconds
    #[arg(long, env = "REFRESH_PASS_TIMEOUT_SECS", default_value = "60")]
    pub refresh_pass_timeout_secs: u64,

    /// Maximum accounts considered per refresh pass
    #[arg(long, env = "REFRESH_BATCH_SIZE", default_value = "100")]
    pub refresh_batch_size: u64,

    /// Keep retrying accounts already flagged needs_reauth (the upstream
    /// behavior). Off by default: such accounts wait for the user to re-link.
    #[arg(long, env = "REFRESH_RETRY_NEEDS_REAUTH")]
    pub refresh_retry_needs_reauth: bool,

    /// Google OAuth Client ID
    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    pub google_client_id: Option<String>,

    /// Google OAuth Client Secret
    #[arg(long, env = "GOOGLE_CLIENT_SECRET")]
    pub google_client_secret: Option<String>,

    /// GitHub OAuth Client ID
    #[arg(long, env = "GITHUB_CLIENT_ID")]
    pub github_client_id: Option<String>,

    /// GitHub OAuth Client Secret
    #[arg(long, env = "GITHUB_CLIENT_SECRET")]
    pub github_client_secret: Option<String>,

    /// Externally reachable base URL used to build OAuth redirect URIs
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Where the browser lands after a successful OAuth callback
    #[arg(
        long,
        env = "OAUTH_SUCCESS_REDIRECT",
        default_value = "http://localhost:3000/"
    )]
    pub oauth_success_redirect: String,

    /// Shared secret for the admin surface; unset disables it entirely
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl ServeConfig {
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_origin_parsing_trims_whitespace() {
        let config = ServeConfig::parse_from([
            "serve",
            "--token-enc-key",
            "unused",
            "--cors-origins",
            "http://localhost:3000, http://example.com",
        ]);

        let origins = config.cors_origin_list();
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "http://localhost:3000");
        assert_eq!(origins[1], "http://example.com");
    }

    #[test]
    fn refresh_defaults_match_documented_values() {
        let config = ServeConfig::parse_from(["serve", "--token-enc-key", "unused"]);
        assert_eq!(config.refresh_interval_secs, 300);
        assert_eq!(config.refresh_window_secs, 600);
        assert_eq!(config.refresh_fail_threshold, 3);
        assert_eq!(config.refresh_account_timeout_secs, 20);
        assert_eq!(config.refresh_pass_timeout_secs, 60);
        assert_eq!(config.refresh_batch_size, 100);
        assert!(!config.refresh_retry_needs_reauth);
    }
}
