//! `trib sync`: run sync cycles and report per-provider results.
//!
//! A single account is synced in the foreground. `--all` syncs every
//! account concurrently on a [`JoinSet`]; providers within one account
//! still run one after another. An account whose task panics is reported
//! as failed.
//!
//! Exit codes: `0` when every cycle ran (even if some providers failed),
//! `2` when an account needs to be reconnected, `1` for other
//! account-level failures.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::task::{self, JoinError, JoinSet};
use tracing::error;

use tributary_core::models::{ProviderKind, RunStatus, SyncSourceResult};
use tributary_core::store::CredentialStore;
use tributary_core::SyncError;

use crate::config::Config;
use crate::db;
use crate::orchestrator::SyncOrchestrator;
use crate::progress::ProgressMode;
use crate::sqlite_store::SqliteStore;

pub const EXIT_RECONNECT: i32 = 2;
pub const EXIT_FAILURE: i32 = 1;

/// What `trib sync` was asked to do.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub account: Option<String>,
    pub all: bool,
    /// Empty means every provider the account's OAuth provider supports.
    pub providers: Vec<ProviderKind>,
    pub json: bool,
    pub progress: ProgressMode,
}

/// Outcome of one account's cycle, as printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub account: String,
    pub results: Vec<SyncSourceResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reconnect_required: bool,
}

impl AccountReport {
    fn from_outcome(account: String, outcome: Result<Vec<SyncSourceResult>, SyncError>) -> Self {
        match outcome {
            Ok(results) => Self {
                account,
                results,
                error: None,
                reconnect_required: false,
            },
            Err(e) => Self {
                account,
                results: Vec::new(),
                reconnect_required: e.requires_reconnect(),
                error: Some(e.to_string()),
            },
        }
    }

    fn from_join_error(account: String, e: &JoinError) -> Self {
        Self {
            account,
            results: Vec::new(),
            error: Some(format!("sync task did not finish: {}", e)),
            reconnect_required: false,
        }
    }
}

/// Providers to sync for `account_id` when none were requested explicitly.
async fn resolve_providers(
    store: &SqliteStore,
    account_id: &str,
    requested: &[ProviderKind],
) -> Result<Vec<ProviderKind>> {
    if !requested.is_empty() {
        return Ok(requested.to_vec());
    }
    Ok(store
        .get_account(account_id)
        .await?
        .map(|a| ProviderKind::for_oauth_provider(a.oauth_provider))
        .unwrap_or_default())
}

pub async fn run_sync(config: &Config, request: SyncRequest) -> Result<i32> {
    let store = SqliteStore::new(db::connect(config).await?);
    let orchestrator = Arc::new(
        SyncOrchestrator::from_config(config, store.clone())?
            .with_progress(request.progress.reporter()),
    );

    let reports = match (&request.account, request.all) {
        (Some(_), true) => bail!("pass either an account id or --all, not both"),
        (None, false) => bail!("pass an account id, or --all to sync every account"),
        (Some(account_id), false) => {
            let providers = resolve_providers(&store, account_id, &request.providers).await?;
            let outcome = orchestrator.sync_account(account_id, &providers).await;
            vec![AccountReport::from_outcome(account_id.clone(), outcome)]
        }
        (None, true) => sync_all(&store, orchestrator, &request.providers).await?,
    };

    if request.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_reports(&reports);
    }
    Ok(exit_code(&reports))
}

async fn sync_all(
    store: &SqliteStore,
    orchestrator: Arc<SyncOrchestrator>,
    requested: &[ProviderKind],
) -> Result<Vec<AccountReport>> {
    let accounts = store.list_accounts().await?;
    let mut set = JoinSet::new();
    let mut spawned = HashMap::new();

    for account in accounts {
        let providers = if requested.is_empty() {
            ProviderKind::for_oauth_provider(account.oauth_provider)
        } else {
            requested.to_vec()
        };
        let orchestrator = orchestrator.clone();
        let account_id = account.id.clone();
        let handle = set.spawn(async move {
            let outcome = orchestrator.sync_account(&account.id, &providers).await;
            AccountReport::from_outcome(account.id, outcome)
        });
        spawned.insert(handle.id(), account_id);
    }

    Ok(join_reports(set, spawned).await)
}

/// Drain `set` into reports sorted by account. A task that panicked or was
/// cancelled becomes a failed report for the account it was spawned for.
async fn join_reports(
    mut set: JoinSet<AccountReport>,
    mut spawned: HashMap<task::Id, String>,
) -> Vec<AccountReport> {
    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                let account = spawned.remove(&e.id()).unwrap_or_default();
                error!(account = %account, error = %e, "account sync task panicked");
                reports.push(AccountReport::from_join_error(account, &e));
            }
        }
    }
    reports.sort_by(|a, b| a.account.cmp(&b.account));
    reports
}

pub fn exit_code(reports: &[AccountReport]) -> i32 {
    if reports.iter().any(|r| r.reconnect_required) {
        EXIT_RECONNECT
    } else if reports.iter().any(|r| r.error.is_some()) {
        EXIT_FAILURE
    } else {
        0
    }
}

fn print_reports(reports: &[AccountReport]) {
    if reports.is_empty() {
        println!("No accounts to sync.");
        return;
    }

    for report in reports {
        println!("account {}", report.account);
        if let Some(error) = &report.error {
            if report.reconnect_required {
                println!("  reconnect required: {}", error);
            } else {
                println!("  error: {}", error);
            }
            continue;
        }

        println!(
            "  {:<16} {:<10} {:>9} {:>7} {:>7} {:>7}  ERROR",
            "PROVIDER", "STATUS", "PROCESSED", "CREATED", "UPDATED", "DELETED"
        );
        for r in &report.results {
            println!(
                "  {:<16} {:<10} {:>9} {:>7} {:>7} {:>7}  {}",
                r.provider.as_str(),
                r.status.as_str(),
                r.items_processed,
                r.items_created,
                r.items_updated,
                r.items_deleted
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                r.error.as_deref().unwrap_or(""),
            );
        }

        let failed = report
            .results
            .iter()
            .filter(|r| r.status == RunStatus::Failed)
            .count();
        if failed == 0 {
            println!("  ok: {} provider(s) synced", report.results.len());
        } else {
            println!("  {} of {} provider(s) failed", failed, report.results.len());
        }
    }
}
