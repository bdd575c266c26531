//! `trib account` commands: register and list connected accounts.
//!
//! The OAuth consent flow lives outside Tributary; `account add` stores
//! the tokens it produced.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};

use tributary_core::models::{Account, OAuthProvider, ProviderKind};
use tributary_core::store::CredentialStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Arguments for `trib account add`.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: String,
    pub user_id: String,
    pub oauth_provider: OAuthProvider,
    pub label: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    pub expires_in: Option<i64>,
}

impl NewAccount {
    pub fn into_account(self) -> Result<Account> {
        if self.id.trim().is_empty() {
            bail!("account id must not be empty");
        }
        if self.access_token.trim().is_empty() {
            bail!("access token must not be empty");
        }
        Ok(Account {
            id: self.id,
            user_id: self.user_id,
            oauth_provider: self.oauth_provider,
            label: self.label,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_expiry: self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            last_synced_at: None,
        })
    }
}

pub async fn add_account(config: &Config, new: NewAccount) -> Result<()> {
    let account = new.into_account()?;
    let store = SqliteStore::new(db::connect(config).await?);
    store.save_account(&account).await?;

    let kinds: Vec<&str> = ProviderKind::for_oauth_provider(account.oauth_provider)
        .iter()
        .map(|k| k.as_str())
        .collect();
    println!(
        "Saved account {} ({}, {}). Syncable providers: {}",
        account.id,
        account.oauth_provider,
        account.label,
        kinds.join(", ")
    );
    Ok(())
}

pub async fn list_accounts(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let accounts = store.list_accounts().await?;
    if accounts.is_empty() {
        println!("No accounts. Add one with `trib account add`.");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<28} {:<22} LAST SYNC",
        "ACCOUNT", "OAUTH", "LABEL", "TOKEN EXPIRY"
    );
    for account in accounts {
        println!(
            "{:<20} {:<8} {:<28} {:<22} {}",
            account.id,
            account.oauth_provider.as_str(),
            account.label,
            account
                .token_expiry
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".to_string()),
            account
                .last_synced_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account() -> NewAccount {
        NewAccount {
            id: "acct1".into(),
            user_id: "u1".into(),
            oauth_provider: OAuthProvider::Slack,
            label: "team".into(),
            access_token: "xoxp-1".into(),
            refresh_token: None,
            expires_in: Some(3600),
        }
    }

    #[test]
    fn test_expires_in_becomes_absolute_expiry() {
        let account = new_account().into_account().unwrap();
        let expiry = account.token_expiry.unwrap();
        assert!(expiry > Utc::now() + Duration::minutes(59));
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut new = new_account();
        new.access_token = " ".into();
        assert!(new.into_account().is_err());
    }
}
