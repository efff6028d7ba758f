//! Provider adapters: one per upstream identity provider, all behind a
//! common refresh trait so the scheduler never branches on provider names.

use async_trait::async_trait;
use inkauth_core::provider::{Provider, RefreshError, RefreshedCredential};
use std::collections::HashMap;
use std::sync::Arc;

use crate::app_state::OAuthConfig;

pub mod bluesky;
pub mod github;
pub mod google;

pub use bluesky::BlueskyAdapter;
pub use github::GithubAdapter;
pub use google::GoogleAdapter;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Exchange a stored refresh credential for fresh tokens.
    async fn refresh(
        &self,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<RefreshedCredential, RefreshError>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for the providers this deployment can actually serve:
    /// bluesky always, google and github only when client credentials are
    /// configured.
    pub fn builtin(oauth: &OAuthConfig, pds_base: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BlueskyAdapter::new(pds_base)));
        if let (Some(id), Some(secret)) = (&oauth.google_client_id, &oauth.google_client_secret) {
            registry.register(Arc::new(GoogleAdapter::new(id, secret)));
        }
        if let (Some(id), Some(secret)) = (&oauth.github_client_id, &oauth.github_client_secret) {
            registry.register(Arc::new(GithubAdapter::new(id, secret)));
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registers_only_configured_providers() {
        let oauth = OAuthConfig {
            google_client_id: Some("id".to_string()),
            google_client_secret: Some("secret".to_string()),
            github_client_id: None,
            github_client_secret: None,
            redirect_base: "http://localhost:8080".to_string(),
        };
        let registry = ProviderRegistry::builtin(&oauth, "https://bsky.social");

        assert!(registry.get(Provider::Bluesky).is_some());
        assert!(registry.get(Provider::Google).is_some());
        assert!(registry.get(Provider::Github).is_none());
    }

    #[test]
    fn register_replaces_by_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(BlueskyAdapter::new("https://bsky.social")));
        registry.register(Arc::new(BlueskyAdapter::new("https://pds.example.com")));
        assert!(registry.get(Provider::Bluesky).is_some());
        assert_eq!(registry.adapters.len(), 1);
    }
}
