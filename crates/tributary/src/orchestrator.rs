//! Sync Orchestrator: drives one account's sync cycle.
//!
//! ```text
//! sync_account(account, providers)
//!   ├─ load account ─ refresh token          (failure aborts the cycle)
//!   ├─ for each provider, sequentially:
//!   │    lock pair → start run → last cursor → fetch → merge
//!   │    → reconcile (fresh + complete fetches only) → finish run
//!   └─ mark account synced
//! ```
//!
//! Provider runs are isolated: any error inside one run is written to its
//! ledger row and the loop moves on. Only credential and account lookup
//! failures escape as [`SyncError`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tributary_core::connector::ConnectorRegistry;
use tributary_core::merge::MergeEngine;
use tributary_core::models::{
    Account, Cursor, OAuthProvider, ProviderKind, RunError, RunOutcome, RunStatus,
    SyncSourceResult, SyncStats,
};
use tributary_core::reconcile::DeletionReconciler;
use tributary_core::store::{CredentialStore, ItemStore, RunLedger};
use tributary_core::token::{TokenExchanger, TokenRefresher};
use tributary_core::{ConnectorError, SyncError};

use crate::config::Config;
use crate::oauth::HttpTokenExchanger;
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::registry::build_registry;
use crate::sqlite_store::SqliteStore;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure of a single provider run. Captured into the ledger, never raised.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] ConnectorError),

    #[error("provider '{provider}' cannot be synced with a {oauth} account")]
    Unsupported {
        provider: ProviderKind,
        oauth: OAuthProvider,
    },

    #[error("no connector registered for provider '{0}'")]
    NotRegistered(ProviderKind),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("run ledger error: {0:#}")]
    Ledger(anyhow::Error),

    #[error("all {chunks} merge chunks failed: {message}")]
    Merge { chunks: usize, message: String },

    #[error("reconciliation failed: {0:#}")]
    Reconcile(anyhow::Error),
}

impl ProviderError {
    /// Step the error came from, stored as the run's error context.
    pub fn context(&self) -> &'static str {
        match self {
            ProviderError::Fetch(_) | ProviderError::Timeout(_) => "fetch",
            ProviderError::Unsupported { .. } | ProviderError::NotRegistered(_) => "connector",
            ProviderError::Ledger(_) => "ledger",
            ProviderError::Merge { .. } => "merge",
            ProviderError::Reconcile(_) => "reconcile",
        }
    }
}

/// Counters accumulated while a run progresses, kept even if it fails.
#[derive(Debug, Default)]
struct RunTally {
    stats: SyncStats,
    /// Set only when reconciliation ran.
    deleted: Option<u64>,
}

pub struct SyncOrchestrator {
    items: Arc<dyn ItemStore>,
    ledger: Arc<dyn RunLedger>,
    credentials: Arc<dyn CredentialStore>,
    refresher: TokenRefresher,
    merge: MergeEngine,
    reconciler: DeletionReconciler,
    registry: ConnectorRegistry,
    fetch_timeout: Duration,
    page_size: Option<usize>,
    progress: Arc<dyn SyncProgressReporter>,
    pair_locks: Mutex<HashMap<(String, ProviderKind), Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncOrchestrator {
    pub fn new(
        items: Arc<dyn ItemStore>,
        ledger: Arc<dyn RunLedger>,
        credentials: Arc<dyn CredentialStore>,
        exchanger: Arc<dyn TokenExchanger>,
        registry: ConnectorRegistry,
    ) -> Self {
        Self {
            refresher: TokenRefresher::new(credentials.clone(), exchanger),
            merge: MergeEngine::new(items.clone()),
            reconciler: DeletionReconciler::new(items.clone()),
            items,
            ledger,
            credentials,
            registry,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            page_size: None,
            progress: Arc::new(NoProgress),
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the orchestrator to a SQLite store, the HTTP token exchanger and
    /// the built-in connectors, tuned by `[sync]`.
    pub fn from_config(config: &Config, store: SqliteStore) -> Result<Self> {
        let store = Arc::new(store);
        let exchanger = Arc::new(HttpTokenExchanger::new(config.oauth.clone())?);
        let registry = build_registry(config)?;
        Ok(
            Self::new(store.clone(), store.clone(), store, exchanger, registry)
                .with_batch_size(config.sync.batch_size)
                .with_token_skew(chrono::Duration::seconds(config.sync.token_skew_secs))
                .with_fetch_timeout(config.fetch_timeout())
                .with_page_size(config.sync.page_size),
        )
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.merge = MergeEngine::new(self.items.clone()).with_batch_size(batch_size);
        self.reconciler = DeletionReconciler::new(self.items.clone()).with_batch_size(batch_size);
        self
    }

    pub fn with_token_skew(mut self, skew: chrono::Duration) -> Self {
        self.refresher = self.refresher.with_skew(skew);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Sync `providers` for one account, one provider at a time.
    ///
    /// Returns one result per distinct provider, in request order. Fails
    /// only when the account is unknown or its credentials cannot be made
    /// valid; in that case no provider is attempted.
    #[tracing::instrument(level = "info", skip(self, providers), fields(providers = providers.len()))]
    pub async fn sync_account(
        &self,
        account_id: &str,
        providers: &[ProviderKind],
    ) -> Result<Vec<SyncSourceResult>, SyncError> {
        let account = self
            .credentials
            .get_account(account_id)
            .await
            .map_err(SyncError::Store)?
            .ok_or_else(|| SyncError::AccountNotFound(account_id.to_string()))?;

        let token = self.refresher.ensure_valid_token(&account).await.map_err(|e| {
            error!(error = %e, "credentials unusable; aborting account sync");
            e
        })?;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(providers.len());
        for &provider in providers {
            if !seen.insert(provider) {
                continue;
            }
            results.push(self.sync_provider(&account, &token, provider).await);
        }

        if let Err(e) = self.credentials.mark_synced(&account.id, Utc::now()).await {
            warn!(error = %format!("{:#}", e), "failed to record last sync time");
        }

        let failed = results
            .iter()
            .filter(|r| r.status == RunStatus::Failed)
            .count();
        info!(providers = results.len(), failed, "account sync finished");
        Ok(results)
    }

    fn pair_lock(&self, account_id: &str, provider: ProviderKind) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .pair_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry((account_id.to_string(), provider))
            .or_default()
            .clone()
    }

    #[tracing::instrument(level = "info", skip(self, account, token), fields(account = %account.id))]
    async fn sync_provider(
        &self,
        account: &Account,
        token: &str,
        provider: ProviderKind,
    ) -> SyncSourceResult {
        let lock = self.pair_lock(&account.id, provider);
        let _guard = lock.lock().await;

        let run = match self.ledger.start_run(&account.id, provider, Utc::now()).await {
            Ok(run) => run,
            Err(e) => {
                let e = ProviderError::Ledger(e);
                error!(error = %e, "could not start run");
                return failed_result(provider, &SyncStats::default(), e.to_string());
            }
        };

        let mut tally = RunTally::default();
        let outcome = match self.run_steps(account, token, provider, &mut tally).await {
            Ok(cursor) => RunOutcome::Completed {
                cursor,
                stats: tally.stats,
            },
            Err(e) => {
                warn!(error = %e, context = e.context(), "provider run failed");
                RunOutcome::Failed {
                    stats: tally.stats,
                    error: RunError {
                        message: e.to_string(),
                        context: e.context().to_string(),
                    },
                }
            }
        };

        if let Err(e) = self.ledger.finish_run(&run.id, &outcome, Utc::now()).await {
            let e = ProviderError::Ledger(e);
            error!(run_id = %run.id, error = %e, "could not finish run");
            return failed_result(provider, &tally.stats, e.to_string());
        }

        self.progress.report(SyncProgressEvent::Finished {
            account: account.id.clone(),
            provider,
            status: outcome.status(),
            created: tally.stats.created,
            updated: tally.stats.updated,
            deleted: tally.deleted,
        });

        match outcome {
            RunOutcome::Completed { stats, .. } => SyncSourceResult {
                provider,
                status: RunStatus::Completed,
                items_processed: stats.processed,
                items_created: stats.created,
                items_updated: stats.updated,
                items_deleted: tally.deleted,
                error: None,
            },
            RunOutcome::Failed { stats, error } => failed_result(provider, &stats, error.message),
        }
    }

    /// The fallible part of a run. Returns the cursor to store: the page's
    /// next cursor, or the cursor the run started from when some chunks
    /// failed to merge.
    async fn run_steps(
        &self,
        account: &Account,
        token: &str,
        provider: ProviderKind,
        tally: &mut RunTally,
    ) -> Result<Option<Cursor>, ProviderError> {
        let cursor = self
            .ledger
            .last_completed_cursor(&account.id, provider)
            .await
            .map_err(ProviderError::Ledger)?;

        if provider.oauth_provider() != account.oauth_provider {
            return Err(ProviderError::Unsupported {
                provider,
                oauth: account.oauth_provider,
            });
        }
        let connector = self
            .registry
            .get(provider)
            .ok_or(ProviderError::NotRegistered(provider))?;

        self.progress.report(SyncProgressEvent::Fetching {
            account: account.id.clone(),
            provider,
            incremental: cursor.is_some(),
        });
        let page = tokio::time::timeout(
            self.fetch_timeout,
            connector.fetch(token, cursor.as_ref(), self.page_size),
        )
        .await
        .map_err(|_| ProviderError::Timeout(self.fetch_timeout))??;

        tally.stats.processed = page.records.len() as u64;
        self.progress.report(SyncProgressEvent::Fetched {
            account: account.id.clone(),
            provider,
            records: tally.stats.processed,
            restarted: page.restarted,
        });
        if page.restarted {
            info!("stored cursor was rejected; connector restarted from scratch");
        }

        let current_ids: HashSet<String> = page.external_ids().map(str::to_string).collect();
        let reconcile = cursor.is_none() && page.complete;

        let report = self
            .merge
            .upsert(&account.id, provider, page.records)
            .await;
        tally.stats.created = report.created;
        tally.stats.updated = report.updated;

        if report.is_partial() && report.written() == 0 {
            let first = &report.failed_chunks[0];
            return Err(ProviderError::Merge {
                chunks: report.failed_chunks.len(),
                message: first.message.clone(),
            });
        }

        if reconcile {
            let deleted = self
                .reconciler
                .reconcile(&account.id, provider, &current_ids)
                .await
                .map_err(ProviderError::Reconcile)?;
            tally.stats.deleted = deleted;
            tally.deleted = Some(deleted);
        } else {
            debug!(
                incremental = cursor.is_some(),
                complete = page.complete,
                "reconciliation skipped"
            );
        }

        if report.is_partial() {
            warn!(
                failed_chunks = report.failed_chunks.len(),
                "merge was partial; keeping the starting cursor so the range is fetched again"
            );
            return Ok(cursor);
        }
        Ok(page.next_cursor)
    }
}

fn failed_result(provider: ProviderKind, stats: &SyncStats, error: String) -> SyncSourceResult {
    SyncSourceResult {
        provider,
        status: RunStatus::Failed,
        items_processed: stats.processed,
        items_created: stats.created,
        items_updated: stats.updated,
        items_deleted: None,
        error: Some(error),
    }
}
