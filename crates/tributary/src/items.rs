//! `trib items`: list canonical items for an account.

use anyhow::Result;

use tributary_core::models::ProviderKind;
use tributary_core::store::{ItemQuery, ItemStore};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

const TITLE_WIDTH: usize = 48;

pub async fn list_items(
    config: &Config,
    account_id: &str,
    query: ItemQuery,
    json: bool,
) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let items = store.list_items(account_id, &query).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("No items.");
        return Ok(());
    }

    println!(
        "{:<17} {:<16} {:<8} {:<width$} EXTERNAL ID",
        "OCCURRED",
        "PROVIDER",
        "STATUS",
        "TITLE",
        width = TITLE_WIDTH
    );
    for item in &items {
        println!(
            "{:<17} {:<16} {:<8} {:<width$} {}",
            item.occurred_at.format("%Y-%m-%d %H:%M"),
            item.provider.as_str(),
            item.status.as_str(),
            clip(&item.title, TITLE_WIDTH),
            item.external_id,
            width = TITLE_WIDTH
        );
    }
    println!("{} item(s)", items.len());
    Ok(())
}

/// Build the query for `trib items` flags.
pub fn item_query(
    provider: Option<ProviderKind>,
    include_deleted: bool,
    limit: usize,
) -> ItemQuery {
    ItemQuery {
        provider,
        include_deleted,
        limit: Some(limit),
    }
}

fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}
