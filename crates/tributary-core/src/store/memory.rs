//! In-memory store for tests and library users without SQLite.
//!
//! Implements [`ItemStore`], [`RunLedger`] and [`CredentialStore`] with
//! `HashMap` and `Vec` behind `std::sync::RwLock`. Runs are kept in
//! insertion order, which is also their start order.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Account, Cursor, Item, ItemRef, ItemStatus, ItemWrite, ProviderKind, RunOutcome, RunStatus,
    SyncRun,
};

use super::{CredentialStore, ItemQuery, ItemStore, RunLedger};

type ItemKey = (String, ProviderKind, String);

/// In-memory implementation of every storage trait.
pub struct InMemoryStore {
    items: RwLock<HashMap<ItemKey, Item>>,
    runs: RwLock<Vec<SyncRun>>,
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored items (any status) for an account.
    pub fn item_count(&self, account_id: &str) -> usize {
        self.items
            .read()
            .unwrap()
            .keys()
            .filter(|(acct, _, _)| acct == account_id)
            .count()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(write: &ItemWrite) -> ItemKey {
    (
        write.account_id.clone(),
        write.provider,
        write.record.external_id.clone(),
    )
}

#[async_trait]
impl ItemStore for InMemoryStore {
    async fn existing_external_ids(
        &self,
        account_id: &str,
        provider: ProviderKind,
        external_ids: &[String],
    ) -> Result<HashSet<String>> {
        let items = self.items.read().unwrap();
        Ok(external_ids
            .iter()
            .filter(|ext| items.contains_key(&(account_id.to_string(), provider, (*ext).clone())))
            .cloned()
            .collect())
    }

    async fn insert_items(&self, writes: &[ItemWrite]) -> Result<()> {
        let now = Utc::now();
        let mut items = self.items.write().unwrap();
        for write in writes {
            let key = key_of(write);
            if items.contains_key(&key) {
                bail!(
                    "item ({}, {}, {}) already exists",
                    write.account_id,
                    write.provider,
                    write.record.external_id
                );
            }
            let record = &write.record;
            items.insert(
                key,
                Item {
                    id: uuid::Uuid::new_v4().to_string(),
                    account_id: write.account_id.clone(),
                    provider: write.provider,
                    external_id: record.external_id.clone(),
                    title: record.title.clone(),
                    excerpt: record.excerpt.clone(),
                    body: record.body.clone(),
                    url: record.url.clone(),
                    occurred_at: record.occurred_at,
                    metadata: record.metadata.clone(),
                    status: ItemStatus::Active,
                    content_hash: write.content_hash.clone(),
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                },
            );
        }
        Ok(())
    }

    async fn update_items(&self, writes: &[ItemWrite]) -> Result<u64> {
        let now = Utc::now();
        let mut items = self.items.write().unwrap();
        let mut updated = 0;
        for write in writes {
            if let Some(item) = items.get_mut(&key_of(write)) {
                let record = &write.record;
                item.title = record.title.clone();
                item.excerpt = record.excerpt.clone();
                item.body = record.body.clone();
                item.url = record.url.clone();
                item.occurred_at = record.occurred_at;
                item.metadata = record.metadata.clone();
                item.content_hash = write.content_hash.clone();
                item.status = ItemStatus::Active;
                item.deleted_at = None;
                item.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn list_active(&self, account_id: &str, provider: ProviderKind) -> Result<Vec<ItemRef>> {
        let items = self.items.read().unwrap();
        Ok(items
            .values()
            .filter(|i| {
                i.account_id == account_id
                    && i.provider == provider
                    && i.status == ItemStatus::Active
            })
            .map(|i| ItemRef {
                id: i.id.clone(),
                external_id: i.external_id.clone(),
            })
            .collect())
    }

    async fn soft_delete(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        let ids: HashSet<&String> = item_ids.iter().collect();
        let mut items = self.items.write().unwrap();
        let mut changed = 0;
        for item in items.values_mut() {
            if item.status == ItemStatus::Active && ids.contains(&item.id) {
                item.status = ItemStatus::Deleted;
                item.deleted_at = Some(at);
                item.updated_at = at;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_item(
        &self,
        account_id: &str,
        provider: ProviderKind,
        external_id: &str,
    ) -> Result<Option<Item>> {
        let items = self.items.read().unwrap();
        Ok(items
            .get(&(
                account_id.to_string(),
                provider,
                external_id.to_string(),
            ))
            .cloned())
    }

    async fn list_items(&self, account_id: &str, query: &ItemQuery) -> Result<Vec<Item>> {
        let items = self.items.read().unwrap();
        let mut out: Vec<Item> = items
            .values()
            .filter(|i| i.account_id == account_id)
            .filter(|i| query.provider.map_or(true, |p| i.provider == p))
            .filter(|i| query.include_deleted || i.status == ItemStatus::Active)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

#[async_trait]
impl RunLedger for InMemoryStore {
    async fn start_run(
        &self,
        account_id: &str,
        provider: ProviderKind,
        started_at: DateTime<Utc>,
    ) -> Result<SyncRun> {
        let run = SyncRun::new_running(account_id, provider, started_at);
        self.runs.write().unwrap().push(run.clone());
        Ok(run)
    }

    async fn last_completed_cursor(
        &self,
        account_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<Cursor>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .iter()
            .rev()
            .find(|r| {
                r.account_id == account_id
                    && r.provider == provider
                    && r.status == RunStatus::Completed
            })
            .and_then(|r| r.cursor.clone()))
    }

    async fn finish_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncRun> {
        let mut runs = self.runs.write().unwrap();
        let Some(run) = runs.iter_mut().find(|r| r.id == run_id) else {
            bail!("sync run '{}' not found", run_id);
        };
        if run.status.is_terminal() {
            bail!(
                "sync run '{}' already finished as {}",
                run_id,
                run.status.as_str()
            );
        }
        run.status = outcome.status();
        run.finished_at = Some(finished_at);
        match outcome {
            RunOutcome::Completed { cursor, stats } => {
                run.cursor = cursor.clone();
                run.stats = *stats;
            }
            RunOutcome::Failed { stats, error } => {
                run.stats = *stats;
                run.error = Some(error.clone());
            }
        }
        Ok(run.clone())
    }

    async fn list_runs(&self, account_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .iter()
            .rev()
            .filter(|r| r.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().unwrap().get(account_id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.read().unwrap().values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        self.accounts
            .write()
            .unwrap()
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap();
        let Some(account) = accounts.get_mut(account_id) else {
            bail!("account '{}' not found", account_id);
        };
        account.access_token = access_token.to_string();
        account.refresh_token = refresh_token.map(str::to_string);
        account.token_expiry = token_expiry;
        Ok(())
    }

    async fn mark_synced(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap();
        let Some(account) = accounts.get_mut(account_id) else {
            bail!("account '{}' not found", account_id);
        };
        account.last_synced_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunError, SyncStats};

    #[tokio::test]
    async fn test_finish_run_is_set_exactly_once() {
        let store = InMemoryStore::new();
        let run = store
            .start_run("acct1", ProviderKind::Gmail, Utc::now())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        let done = store
            .finish_run(
                &run.id,
                &RunOutcome::Completed {
                    cursor: Some(Cursor::new("c1")),
                    stats: SyncStats::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.finished_at.is_some());

        let again = store
            .finish_run(
                &run.id,
                &RunOutcome::Failed {
                    stats: SyncStats::default(),
                    error: RunError {
                        message: "late".into(),
                        context: "fetch".into(),
                    },
                },
                Utc::now(),
            )
            .await;
        assert!(again.is_err());
        let runs = store.list_runs("acct1", 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_last_completed_cursor_ignores_failed_and_running_runs() {
        let store = InMemoryStore::new();
        let first = store
            .start_run("acct1", ProviderKind::Slack, Utc::now())
            .await
            .unwrap();
        store
            .finish_run(
                &first.id,
                &RunOutcome::Completed {
                    cursor: Some(Cursor::new("c1")),
                    stats: SyncStats::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let second = store
            .start_run("acct1", ProviderKind::Slack, Utc::now())
            .await
            .unwrap();
        store
            .finish_run(
                &second.id,
                &RunOutcome::Failed {
                    stats: SyncStats::default(),
                    error: RunError {
                        message: "boom".into(),
                        context: "fetch".into(),
                    },
                },
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .start_run("acct1", ProviderKind::Slack, Utc::now())
            .await
            .unwrap();

        let cursor = store
            .last_completed_cursor("acct1", ProviderKind::Slack)
            .await
            .unwrap();
        assert_eq!(cursor, Some(Cursor::new("c1")));
        assert_eq!(
            store
                .last_completed_cursor("acct1", ProviderKind::Gmail)
                .await
                .unwrap(),
            None
        );
    }
}
