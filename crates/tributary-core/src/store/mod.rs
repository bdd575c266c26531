//! Storage abstraction for Tributary.
//!
//! Three traits describe the persistent state the engine consumes:
//!
//! | Trait | Owns |
//! |-------|------|
//! | [`ItemStore`] | Canonical items keyed by `(account, provider, external id)` |
//! | [`RunLedger`] | One row per sync attempt, including the cursor it produced |
//! | [`CredentialStore`] | Connected accounts and their OAuth tokens |
//!
//! Every component receives the handle it needs explicitly; there is no
//! global connection. Implementations must be `Send + Sync` to work with
//! async runtimes. [`memory::InMemoryStore`] implements all three.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Account, Cursor, Item, ItemRef, ItemWrite, ProviderKind, RunOutcome, SyncRun,
};

/// Filter for [`ItemStore::list_items`].
#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub provider: Option<ProviderKind>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

/// Canonical item storage.
///
/// All batched operations are scoped to one `(account, provider)` pair or to
/// explicit surrogate ids, so concurrent syncs of different accounts never
/// touch the same rows.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Return the subset of `external_ids` that already have a row for the
    /// pair, whatever their status.
    async fn existing_external_ids(
        &self,
        account_id: &str,
        provider: ProviderKind,
        external_ids: &[String],
    ) -> Result<HashSet<String>>;

    /// Insert new items as `active`.
    async fn insert_items(&self, items: &[ItemWrite]) -> Result<()>;

    /// Overwrite existing items matched by identity key.
    ///
    /// Every upstream field is replaced, the status becomes `active` and
    /// `deleted_at` is cleared. Returns the number of rows updated.
    async fn update_items(&self, items: &[ItemWrite]) -> Result<u64>;

    /// All `active` items for the pair.
    async fn list_active(&self, account_id: &str, provider: ProviderKind) -> Result<Vec<ItemRef>>;

    /// Soft-delete the given active items. Returns the number of rows changed.
    async fn soft_delete(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<u64>;

    async fn get_item(
        &self,
        account_id: &str,
        provider: ProviderKind,
        external_id: &str,
    ) -> Result<Option<Item>>;

    /// Items for an account, newest occurrence first.
    async fn list_items(&self, account_id: &str, query: &ItemQuery) -> Result<Vec<Item>>;
}

/// Append-mostly log of synchronization attempts.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Insert a new run in the `running` state.
    async fn start_run(
        &self,
        account_id: &str,
        provider: ProviderKind,
        started_at: DateTime<Utc>,
    ) -> Result<SyncRun>;

    /// Cursor produced by the most recent `completed` run for the pair.
    ///
    /// `None` when no run completed yet, or the latest completed run
    /// produced no cursor; both mean the next fetch starts fresh.
    async fn last_completed_cursor(
        &self,
        account_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<Cursor>>;

    /// Move a `running` run to its terminal state.
    ///
    /// Fails if the run does not exist or is already terminal, so the
    /// terminal status and `finished_at` are written exactly once.
    async fn finish_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncRun>;

    /// Most recent runs for an account, newest first.
    async fn list_runs(&self, account_id: &str, limit: usize) -> Result<Vec<SyncRun>>;
}

/// Connected accounts and their credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Insert or replace an account. Used by the consent flow collaborator.
    async fn save_account(&self, account: &Account) -> Result<()>;

    /// Persist refreshed credentials.
    async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Record the end of a sync cycle.
    async fn mark_synced(&self, account_id: &str, at: DateTime<Utc>) -> Result<()>;
}
