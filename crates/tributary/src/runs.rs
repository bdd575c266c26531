//! `trib runs`: show the run ledger for an account.

use anyhow::Result;

use tributary_core::store::RunLedger;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn list_runs(config: &Config, account_id: &str, limit: usize, json: bool) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let runs = store.list_runs(account_id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs recorded for account {}.", account_id);
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<10} {:>9} {:>7} {:>7} {:>7}  ERROR",
        "STARTED", "PROVIDER", "STATUS", "PROCESSED", "CREATED", "UPDATED", "DELETED"
    );
    for run in runs {
        println!(
            "{:<20} {:<16} {:<10} {:>9} {:>7} {:>7} {:>7}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.provider.as_str(),
            run.status.as_str(),
            run.stats.processed,
            run.stats.created,
            run.stats.updated,
            run.stats.deleted,
            run.error
                .map(|e| format!("[{}] {}", e.context, e.message))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
