//! Token Refresher: hands out a usable access token for an account.
//!
//! The stored token is returned as-is while it has more than the configured
//! skew left before expiry. Otherwise the refresh token is exchanged with
//! the provider and the new credentials are persisted before returning.
//! Any failure here is fatal for the whole account cycle.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::models::{Account, OAuthProvider};
use crate::store::CredentialStore;

/// Default refresh window before expiry, in seconds.
pub const DEFAULT_TOKEN_SKEW_SECS: i64 = 300;

/// Credentials returned by a refresh-token exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Provider-specific refresh-token grant.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn refresh(&self, provider: OAuthProvider, refresh_token: &str)
        -> Result<RefreshedToken>;
}

pub struct TokenRefresher {
    credentials: Arc<dyn CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
    skew: Duration,
}

impl TokenRefresher {
    pub fn new(credentials: Arc<dyn CredentialStore>, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            credentials,
            exchanger,
            skew: Duration::seconds(DEFAULT_TOKEN_SKEW_SECS),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Return a valid access token for `account`, refreshing if needed.
    pub async fn ensure_valid_token(&self, account: &Account) -> Result<String, SyncError> {
        self.ensure_valid_token_at(account, Utc::now()).await
    }

    #[tracing::instrument(level = "debug", skip(self, account), fields(account = %account.id))]
    pub async fn ensure_valid_token_at(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        let Some(expiry) = account.token_expiry else {
            debug!("token has no expiry");
            return Ok(account.access_token.clone());
        };
        if expiry - now > self.skew {
            return Ok(account.access_token.clone());
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            if expiry > now {
                debug!(%expiry, "token close to expiry but not refreshable; using it");
                return Ok(account.access_token.clone());
            }
            return Err(SyncError::CredentialExpired {
                account_id: account.id.clone(),
            });
        };

        let refreshed = self
            .exchanger
            .refresh(account.oauth_provider, refresh_token)
            .await
            .map_err(|e| {
                warn!(error = %e, "token refresh failed");
                SyncError::CredentialRefreshFailed {
                    account_id: account.id.clone(),
                    message: format!("{:#}", e),
                }
            })?;

        let rotated = refreshed.refresh_token.as_deref().or(Some(refresh_token));
        self.credentials
            .update_tokens(
                &account.id,
                &refreshed.access_token,
                rotated,
                refreshed.expires_at,
            )
            .await
            .map_err(|e| SyncError::CredentialRefreshFailed {
                account_id: account.id.clone(),
                message: format!("persisting refreshed token: {:#}", e),
            })?;

        info!(expires_at = ?refreshed.expires_at, "access token refreshed");
        Ok(refreshed.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use std::sync::Mutex;

    struct FakeExchanger {
        calls: Mutex<Vec<String>>,
        fail: bool,
        rotate: bool,
    }

    impl FakeExchanger {
        fn new(fail: bool, rotate: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail,
                rotate,
            }
        }
    }

    #[async_trait]
    impl TokenExchanger for FakeExchanger {
        async fn refresh(
            &self,
            _provider: OAuthProvider,
            refresh_token: &str,
        ) -> Result<RefreshedToken> {
            self.calls.lock().unwrap().push(refresh_token.to_string());
            if self.fail {
                anyhow::bail!("invalid_grant");
            }
            Ok(RefreshedToken {
                access_token: "fresh-access".to_string(),
                refresh_token: self.rotate.then(|| "rotated-refresh".to_string()),
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
        }
    }

    fn account(expiry: Option<DateTime<Utc>>, refresh: Option<&str>) -> Account {
        Account {
            id: "acct1".to_string(),
            user_id: "user1".to_string(),
            oauth_provider: OAuthProvider::Google,
            label: "me@example.com".to_string(),
            access_token: "stored-access".to_string(),
            refresh_token: refresh.map(str::to_string),
            token_expiry: expiry,
            last_synced_at: None,
        }
    }

    async fn setup(
        acct: &Account,
        exchanger: FakeExchanger,
    ) -> (Arc<InMemoryStore>, Arc<FakeExchanger>, TokenRefresher) {
        let store = Arc::new(InMemoryStore::new());
        store.save_account(acct).await.unwrap();
        let exchanger = Arc::new(exchanger);
        let refresher = TokenRefresher::new(store.clone(), exchanger.clone());
        (store, exchanger, refresher)
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh() {
        let now = Utc::now();
        let acct = account(Some(now + Duration::hours(1)), Some("r1"));
        let (_, exchanger, refresher) = setup(&acct, FakeExchanger::new(false, false)).await;

        let token = refresher.ensure_valid_token_at(&acct, now).await.unwrap();
        assert_eq!(token, "stored-access");
        assert!(exchanger.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_without_expiry_never_refreshes() {
        let acct = account(None, None);
        let (_, exchanger, refresher) = setup(&acct, FakeExchanger::new(false, false)).await;

        let token = refresher.ensure_valid_token(&acct).await.unwrap();
        assert_eq!(token, "stored-access");
        assert!(exchanger.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_inside_skew_is_refreshed_and_persisted() {
        let now = Utc::now();
        let acct = account(Some(now + Duration::minutes(2)), Some("r1"));
        let (store, exchanger, refresher) = setup(&acct, FakeExchanger::new(false, false)).await;

        let token = refresher.ensure_valid_token_at(&acct, now).await.unwrap();
        assert_eq!(token, "fresh-access");
        assert_eq!(*exchanger.calls.lock().unwrap(), vec!["r1".to_string()]);

        let saved = store.get_account("acct1").await.unwrap().unwrap();
        assert_eq!(saved.access_token, "fresh-access");
        assert_eq!(saved.refresh_token.as_deref(), Some("r1"));
        assert!(saved.token_expiry.unwrap() > now + Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let now = Utc::now();
        let acct = account(Some(now - Duration::minutes(1)), Some("r1"));
        let (store, _, refresher) = setup(&acct, FakeExchanger::new(false, true)).await;

        refresher.ensure_valid_token_at(&acct, now).await.unwrap();
        let saved = store.get_account("acct1").await.unwrap().unwrap();
        assert_eq!(saved.refresh_token.as_deref(), Some("rotated-refresh"));
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_credential_expired() {
        let now = Utc::now();
        let acct = account(Some(now - Duration::seconds(1)), None);
        let (_, _, refresher) = setup(&acct, FakeExchanger::new(false, false)).await;

        let err = refresher.ensure_valid_token_at(&acct, now).await.unwrap_err();
        assert!(matches!(err, SyncError::CredentialExpired { .. }));
    }

    #[tokio::test]
    async fn test_near_expiry_without_refresh_token_still_usable() {
        let now = Utc::now();
        let acct = account(Some(now + Duration::minutes(1)), None);
        let (_, _, refresher) = setup(&acct, FakeExchanger::new(false, false)).await;

        let token = refresher.ensure_valid_token_at(&acct, now).await.unwrap();
        assert_eq!(token, "stored-access");
    }

    #[tokio::test]
    async fn test_exchange_failure_is_refresh_failed() {
        let now = Utc::now();
        let acct = account(Some(now - Duration::hours(1)), Some("revoked"));
        let (store, _, refresher) = setup(&acct, FakeExchanger::new(true, false)).await;

        let err = refresher.ensure_valid_token_at(&acct, now).await.unwrap_err();
        match err {
            SyncError::CredentialRefreshFailed { message, .. } => {
                assert!(message.contains("invalid_grant"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let saved = store.get_account("acct1").await.unwrap().unwrap();
        assert_eq!(saved.access_token, "stored-access");
    }

    #[tokio::test]
    async fn test_custom_skew_widens_refresh_window() {
        let now = Utc::now();
        let acct = account(Some(now + Duration::minutes(20)), Some("r1"));
        let (_, exchanger, refresher) = setup(&acct, FakeExchanger::new(false, false)).await;
        let refresher = refresher.with_skew(Duration::minutes(30));

        let token = refresher.ensure_valid_token_at(&acct, now).await.unwrap();
        assert_eq!(token, "fresh-access");
        assert_eq!(exchanger.calls.lock().unwrap().len(), 1);
    }
}
