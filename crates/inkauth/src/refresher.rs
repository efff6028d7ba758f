//! Background refresh scheduler. One pass per tick: scan accounts whose
//! access token expires inside the lookahead window, refresh each through its
//! provider adapter, persist the outcome. A single-permit guard keeps passes
//! from overlapping when one runs long.

use chrono::Utc;
use entity::account;
use inkauth_core::provider::{Provider, RefreshError};
use sea_orm::DbErr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::config::ServeConfig;
use crate::providers::ProviderRegistry;
use crate::store;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Time between passes.
    pub interval: Duration,
    /// Lookahead: accounts expiring within this window are refreshed early.
    pub window: chrono::Duration,
    /// Consecutive failures before an account is flagged needs_reauth.
    pub fail_threshold: u32,
    /// Budget for one account's refresh attempt.
    pub account_timeout: Duration,
    /// Budget for a whole pass.
    pub pass_timeout: Duration,
    /// Max accounts per pass.
    pub batch_size: u64,
    /// Keep retrying accounts already flagged needs_reauth.
    pub retry_needs_reauth: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            window: chrono::Duration::seconds(600),
            fail_threshold: 3,
            account_timeout: Duration::from_secs(20),
            pass_timeout: Duration::from_secs(60),
            batch_size: 100,
            retry_needs_reauth: false,
        }
    }
}

impl RefreshSettings {
    pub fn from_config(cfg: &ServeConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.refresh_interval_secs),
            window: chrono::Duration::seconds(cfg.refresh_window_secs as i64),
            fail_threshold: cfg.refresh_fail_threshold,
            account_timeout: Duration::from_secs(cfg.refresh_account_timeout_secs),
            pass_timeout: Duration::from_secs(cfg.refresh_pass_timeout_secs),
            batch_size: cfg.refresh_batch_size,
            retry_needs_reauth: cfg.refresh_retry_needs_reauth,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    pub scanned: usize,
    pub refreshed: usize,
    pub failed: usize,
}

pub struct Refresher {
    state: Arc<AppState>,
    registry: Arc<ProviderRegistry>,
    settings: RefreshSettings,
    pass_guard: Arc<Semaphore>,
}

impl Refresher {
    pub fn new(
        state: Arc<AppState>,
        registry: Arc<ProviderRegistry>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            state,
            registry,
            settings,
            pass_guard: Arc::new(Semaphore::new(1)),
        }
    }

    /// Run the tick loop until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!(
                "[refresher] started: interval {:?}, window {}s, threshold {}",
                self.settings.interval,
                self.settings.window.num_seconds(),
                self.settings.fail_threshold
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("[refresher] shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One guarded, time-boxed pass. A tick that lands while the previous
    /// pass still holds the permit is dropped, not queued.
    pub async fn tick(&self) {
        let Ok(_permit) = self.pass_guard.clone().try_acquire_owned() else {
            log::warn!("[refresher] previous pass still running, skipping tick");
            return;
        };

        match tokio::time::timeout(self.settings.pass_timeout, self.run_pass()).await {
            Ok(Ok(stats)) => {
                if stats.scanned > 0 {
                    log::info!(
                        "[refresher] pass done: {} scanned, {} refreshed, {} failed",
                        stats.scanned,
                        stats.refreshed,
                        stats.failed
                    );
                }
            }
            Ok(Err(err)) => log::error!("[refresher] pass failed: {err}"),
            Err(_) => log::warn!(
                "[refresher] pass exceeded {:?} and was aborted",
                self.settings.pass_timeout
            ),
        }
    }

    /// Scan and refresh, sequentially, soonest-expiring first.
    pub async fn run_pass(&self) -> Result<PassStats, DbErr> {
        let cutoff = Utc::now() + self.settings.window;
        let candidates = store::refresh_candidates(
            &self.state.db,
            cutoff,
            self.settings.batch_size,
            self.settings.retry_needs_reauth,
        )
        .await?;

        let mut stats = PassStats {
            scanned: candidates.len(),
            ..Default::default()
        };

        for acct in candidates {
            let attempt = tokio::time::timeout(
                self.settings.account_timeout,
                self.refresh_account(&acct),
            )
            .await
            .unwrap_or_else(|_| {
                Err(RefreshError::Transport(format!(
                    "refresh attempt exceeded {:?}",
                    self.settings.account_timeout
                )))
            });

            match attempt {
                Ok(cred) => {
                    match store::apply_refresh_success(
                        &self.state.db,
                        &acct,
                        &cred,
                        &self.state.sealer,
                        Utc::now(),
                    )
                    .await
                    {
                        Ok(updated) => {
                            stats.refreshed += 1;
                            log::debug!(
                                "[refresher] account {} ({}) refreshed, expires {:?}",
                                updated.id,
                                updated.provider,
                                updated.expires_at
                            );
                        }
                        Err(err) => {
                            // Tokens were minted but not stored; next pass retries.
                            stats.failed += 1;
                            log::error!(
                                "[refresher] account {}: persisting refreshed tokens failed: {err}",
                                acct.id
                            );
                        }
                    }
                }
                Err(err) => {
                    stats.failed += 1;
                    self.note_failure(&acct, &err).await;
                }
            }
        }

        Ok(stats)
    }

    async fn note_failure(&self, acct: &account::Model, err: &RefreshError) {
        if !err.counts_toward_threshold() {
            log::debug!("[refresher] account {} skipped: {err}", acct.id);
            return;
        }

        match store::record_refresh_failure(
            &self.state.db,
            &acct.id,
            err,
            self.settings.fail_threshold,
            Utc::now(),
        )
        .await
        {
            Ok(updated) => {
                let refresh = &updated.provider_data.refresh;
                if refresh.needs_reauth && !acct.provider_data.refresh.needs_reauth {
                    log::warn!(
                        "[refresher] account {} ({}) flagged needs_reauth after {} failures: {err}",
                        updated.id,
                        updated.provider,
                        refresh.fail_count
                    );
                } else {
                    log::warn!(
                        "[refresher] account {} ({}) refresh failed ({}/{}): {err}",
                        updated.id,
                        updated.provider,
                        refresh.fail_count,
                        self.settings.fail_threshold
                    );
                }
            }
            Err(db_err) => log::error!(
                "[refresher] account {}: recording refresh failure failed: {db_err}",
                acct.id
            ),
        }
    }

    /// One attempt: decode the provider, decrypt the refresh credential,
    /// call the adapter. Persistence happens in `run_pass`.
    async fn refresh_account(
        &self,
        acct: &account::Model,
    ) -> Result<inkauth_core::provider::RefreshedCredential, RefreshError> {
        let provider = Provider::from_str(&acct.provider).map_err(|_| {
            RefreshError::BadResponse(format!("unknown provider {:?}", acct.provider))
        })?;
        let Some(adapter) = self.registry.get(provider) else {
            return Err(RefreshError::BadResponse(format!(
                "no adapter registered for {provider}"
            )));
        };

        if acct.refresh_token_enc.is_empty() {
            return Err(RefreshError::NoRefreshCredential);
        }
        let refresh_token = self
            .state
            .sealer
            .open_b64(&acct.refresh_token_enc)
            .map_err(|_| RefreshError::Decrypt)?;

        adapter.refresh(&self.state.http, &refresh_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderAdapter;
    use crate::store::{NewLogin, UserProfile};
    use crate::test_util::{test_sealer, test_state};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use entity::account::ProviderMetadata;
    use inkauth_core::provider::RefreshedCredential;
    use sea_orm::EntityTrait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct StubAdapter {
        provider: Provider,
        results: Mutex<VecDeque<Result<RefreshedCredential, RefreshError>>>,
    }

    impl StubAdapter {
        fn new(
            provider: Provider,
            results: Vec<Result<RefreshedCredential, RefreshError>>,
        ) -> Self {
            Self {
                provider,
                results: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn refresh(
            &self,
            _http: &reqwest::Client,
            _refresh_token: &str,
        ) -> Result<RefreshedCredential, RefreshError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RefreshError::Transport("stub exhausted".to_string())))
        }
    }

    async fn seed_expiring_account(state: &crate::app_state::AppState) -> account::Model {
        let user = store::find_or_create_user(
            &state.db,
            Provider::Bluesky,
            "did:plc:alice",
            &UserProfile {
                name: "alice.bsky.social",
                username: "alice.bsky.social",
                email: None,
                avatar_url: None,
            },
        )
        .await
        .unwrap();

        store::upsert_account(
            &state.db,
            &user.id,
            NewLogin {
                provider: Provider::Bluesky,
                provider_account_id: "did:plc:alice".to_string(),
                access_token_enc: state.sealer.seal_b64("old-access").unwrap(),
                refresh_token_enc: state.sealer.seal_b64("old-refresh").unwrap(),
                expires_at: Some(Utc::now() + ChronoDuration::minutes(1)),
                metadata: ProviderMetadata::Bluesky {
                    handle: "alice.bsky.social".to_string(),
                    pds_base: "https://bsky.social".to_string(),
                },
            },
        )
        .await
        .unwrap()
    }

    fn refresher_with(
        state: Arc<crate::app_state::AppState>,
        adapter: StubAdapter,
        settings: RefreshSettings,
    ) -> Refresher {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(adapter));
        Refresher::new(state, Arc::new(registry), settings)
    }

    #[tokio::test]
    async fn pass_refreshes_expiring_account() {
        let state = test_state().await;
        let acct = seed_expiring_account(&state).await;

        let adapter = StubAdapter::new(
            Provider::Bluesky,
            vec![Ok(RefreshedCredential {
                access_token: "new-access".to_string(),
                refresh_token: Some("new-refresh".to_string()),
                expires_at: Some(Utc::now() + ChronoDuration::hours(6)),
            })],
        );
        let refresher = refresher_with(state.clone(), adapter, RefreshSettings::default());

        let stats = refresher.run_pass().await.unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.refreshed, 1);
        assert_eq!(stats.failed, 0);

        let sealer = test_sealer();
        let updated = account::Entity::find_by_id(&acct.id)
            .one(&state.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sealer.open_b64(&updated.access_token_enc).unwrap(), "new-access");
        assert_eq!(sealer.open_b64(&updated.refresh_token_enc).unwrap(), "new-refresh");
        assert!(updated.expires_at.unwrap() > Utc::now() + ChronoDuration::hours(5));
    }

    #[tokio::test]
    async fn repeated_failures_escalate_then_stop_retrying() {
        let state = test_state().await;
        let acct = seed_expiring_account(&state).await;

        let adapter = StubAdapter::new(
            Provider::Bluesky,
            vec![
                Err(RefreshError::Provider {
                    error: "ExpiredToken".to_string(),
                    description: None,
                }),
                Err(RefreshError::Provider {
                    error: "ExpiredToken".to_string(),
                    description: None,
                }),
                Err(RefreshError::Provider {
                    error: "ExpiredToken".to_string(),
                    description: None,
                }),
            ],
        );
        let refresher = refresher_with(state.clone(), adapter, RefreshSettings::default());

        for expected_fails in 1..=3u32 {
            let stats = refresher.run_pass().await.unwrap();
            assert_eq!(stats.failed, 1);
            let row = account::Entity::find_by_id(&acct.id)
                .one(&state.db)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.provider_data.refresh.fail_count, expected_fails);
            assert_eq!(row.provider_data.refresh.needs_reauth, expected_fails >= 3);
        }

        // Flagged accounts drop out of the scan under the default policy.
        let stats = refresher.run_pass().await.unwrap();
        assert_eq!(stats.scanned, 0);
    }

    #[tokio::test]
    async fn retry_needs_reauth_keeps_flagged_accounts_in_scan() {
        let state = test_state().await;
        let acct = seed_expiring_account(&state).await;

        let failures: Vec<_> = (0..3)
            .map(|_| {
                Err(RefreshError::Transport("unreachable".to_string()))
            })
            .collect();
        let settings = RefreshSettings {
            retry_needs_reauth: true,
            ..Default::default()
        };
        let refresher = refresher_with(
            state.clone(),
            StubAdapter::new(Provider::Bluesky, failures),
            settings,
        );

        for _ in 0..3 {
            refresher.run_pass().await.unwrap();
        }
        let row = account::Entity::find_by_id(&acct.id)
            .one(&state.db)
            .await
            .unwrap()
            .unwrap();
        assert!(row.provider_data.refresh.needs_reauth);

        // Still scanned under the opt-in policy.
        let stats = refresher.run_pass().await.unwrap();
        assert_eq!(stats.scanned, 1);
    }

    #[tokio::test]
    async fn missing_refresh_credential_does_not_count_toward_threshold() {
        let state = test_state().await;
        let user = store::find_or_create_user(
            &state.db,
            Provider::Github,
            "gh-1",
            &UserProfile {
                name: "alice",
                username: "alice",
                email: None,
                avatar_url: None,
            },
        )
        .await
        .unwrap();
        let acct = store::upsert_account(
            &state.db,
            &user.id,
            NewLogin {
                provider: Provider::Github,
                provider_account_id: "gh-1".to_string(),
                access_token_enc: state.sealer.seal_b64("access").unwrap(),
                refresh_token_enc: String::new(),
                expires_at: Some(Utc::now()),
                metadata: ProviderMetadata::Github {
                    login: "alice".to_string(),
                    name: None,
                    avatar_url: None,
                },
            },
        )
        .await
        .unwrap();

        let settings = RefreshSettings {
            retry_needs_reauth: true,
            ..Default::default()
        };
        let refresher = refresher_with(
            state.clone(),
            StubAdapter::new(Provider::Github, vec![]),
            settings,
        );

        let stats = refresher.run_pass().await.unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.failed, 1);

        let row = account::Entity::find_by_id(&acct.id)
            .one(&state.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.provider_data.refresh.fail_count, 0);
        assert!(!row.provider_data.refresh.needs_reauth);
    }

    #[tokio::test]
    async fn success_after_failures_resets_the_counter() {
        let state = test_state().await;
        let acct = seed_expiring_account(&state).await;

        let adapter = StubAdapter::new(
            Provider::Bluesky,
            vec![
                Err(RefreshError::Transport("blip".to_string())),
                Err(RefreshError::Transport("blip".to_string())),
                Ok(RefreshedCredential {
                    access_token: "recovered".to_string(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() + ChronoDuration::hours(6)),
                }),
            ],
        );
        let refresher = refresher_with(state.clone(), adapter, RefreshSettings::default());

        refresher.run_pass().await.unwrap();
        refresher.run_pass().await.unwrap();
        let stats = refresher.run_pass().await.unwrap();
        assert_eq!(stats.refreshed, 1);

        let row = account::Entity::find_by_id(&acct.id)
            .one(&state.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.provider_data.refresh.fail_count, 0);
        assert!(!row.provider_data.refresh.needs_reauth);
        assert!(row.provider_data.refresh.last_refreshed_at.is_some());
        // Refresh credential was not rotated, old one survives.
        assert_eq!(
            test_sealer().open_b64(&row.refresh_token_enc).unwrap(),
            "old-refresh"
        );
    }
}
