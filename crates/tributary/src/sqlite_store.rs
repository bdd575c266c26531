//! SQLite-backed implementation of the storage traits.
//!
//! [`SqliteStore`] implements [`ItemStore`], [`RunLedger`] and
//! [`CredentialStore`] over the schema created by [`crate::migrate`].
//! Batched lookups and inserts are built with [`sqlx::QueryBuilder`] so a
//! merge chunk costs one `IN (...)` query plus one multi-row `INSERT`.

use std::collections::HashSet;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use tributary_core::models::{
    Account, Cursor, Item, ItemRef, ItemWrite, ProviderKind, RunError, RunOutcome, SyncRun,
    SyncStats,
};
use tributary_core::store::{CredentialStore, ItemQuery, ItemStore, RunLedger};

const ITEM_COLUMNS: &str = "id, account_id, provider, external_id, title, excerpt, body, url, \
     occurred_at, metadata_json, status, content_hash, created_at, updated_at, deleted_at";

const RUN_COLUMNS: &str = "id, account_id, provider, status, started_at, finished_at, cursor, \
     items_processed, items_created, items_updated, items_deleted, error_message, error_context";

const ACCOUNT_COLUMNS: &str = "id, user_id, oauth_provider, label, access_token, refresh_token, \
     token_expiry, last_synced_at";

/// SQLite implementation of every Tributary storage trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Time columns hold Unix microseconds, fine enough for Slack `ts` values.
fn from_ts(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(ts).ok_or_else(|| anyhow!("timestamp out of range: {}", ts))
}

fn from_opt_ts(ts: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ts.map(from_ts).transpose()
}

fn row_to_item(row: &SqliteRow) -> Result<Item> {
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(Item {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        excerpt: row.try_get("excerpt")?,
        body: row.try_get("body")?,
        url: row.try_get("url")?,
        occurred_at: from_ts(row.try_get("occurred_at")?)?,
        metadata: serde_json::from_str(&metadata_json)
            .with_context(|| "Corrupt item metadata_json")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        content_hash: row.try_get("content_hash")?,
        created_at: from_ts(row.try_get("created_at")?)?,
        updated_at: from_ts(row.try_get("updated_at")?)?,
        deleted_at: from_opt_ts(row.try_get("deleted_at")?)?,
    })
}

fn row_to_run(row: &SqliteRow) -> Result<SyncRun> {
    let error_message: Option<String> = row.try_get("error_message")?;
    let error_context: Option<String> = row.try_get("error_context")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        provider: row.try_get::<String, _>("provider")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        started_at: from_ts(row.try_get("started_at")?)?,
        finished_at: from_opt_ts(row.try_get("finished_at")?)?,
        cursor: row.try_get::<Option<String>, _>("cursor")?.map(Cursor::new),
        stats: SyncStats {
            processed: row.try_get::<i64, _>("items_processed")? as u64,
            created: row.try_get::<i64, _>("items_created")? as u64,
            updated: row.try_get::<i64, _>("items_updated")? as u64,
            deleted: row.try_get::<i64, _>("items_deleted")? as u64,
        },
        error: error_message.map(|message| RunError {
            message,
            context: error_context.unwrap_or_default(),
        }),
    })
}

fn row_to_account(row: &SqliteRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        oauth_provider: row.try_get::<String, _>("oauth_provider")?.parse()?,
        label: row.try_get("label")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expiry: from_opt_ts(row.try_get("token_expiry")?)?,
        last_synced_at: from_opt_ts(row.try_get("last_synced_at")?)?,
    })
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn existing_external_ids(
        &self,
        account_id: &str,
        provider: ProviderKind,
        external_ids: &[String],
    ) -> Result<HashSet<String>> {
        if external_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT external_id FROM items WHERE account_id = ");
        qb.push_bind(account_id)
            .push(" AND provider = ")
            .push_bind(provider.as_str())
            .push(" AND external_id IN (");
        let mut separated = qb.separated(", ");
        for id in external_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(Into::into))
            .collect()
    }

    async fn insert_items(&self, items: &[ItemWrite]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_micros();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO items (id, account_id, provider, external_id, title, excerpt, body, url, \
             occurred_at, metadata_json, status, content_hash, created_at, updated_at) ",
        );
        qb.push_values(items, |mut b, write| {
            let record = &write.record;
            b.push_bind(uuid::Uuid::new_v4().to_string())
                .push_bind(&write.account_id)
                .push_bind(write.provider.as_str())
                .push_bind(&record.external_id)
                .push_bind(&record.title)
                .push_bind(&record.excerpt)
                .push_bind(&record.body)
                .push_bind(&record.url)
                .push_bind(record.occurred_at.timestamp_micros())
                .push_bind(record.metadata.to_string())
                .push_bind("active")
                .push_bind(&write.content_hash)
                .push_bind(now)
                .push_bind(now);
        });

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn update_items(&self, items: &[ItemWrite]) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_micros();
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for write in items {
            let record = &write.record;
            let result = sqlx::query(
                r#"
                UPDATE items SET
                    title = ?,
                    excerpt = ?,
                    body = ?,
                    url = ?,
                    occurred_at = ?,
                    metadata_json = ?,
                    content_hash = ?,
                    status = 'active',
                    deleted_at = NULL,
                    updated_at = ?
                WHERE account_id = ? AND provider = ? AND external_id = ?
                "#,
            )
            .bind(&record.title)
            .bind(&record.excerpt)
            .bind(&record.body)
            .bind(&record.url)
            .bind(record.occurred_at.timestamp_micros())
            .bind(record.metadata.to_string())
            .bind(&write.content_hash)
            .bind(now)
            .bind(&write.account_id)
            .bind(write.provider.as_str())
            .bind(&record.external_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn list_active(&self, account_id: &str, provider: ProviderKind) -> Result<Vec<ItemRef>> {
        let rows = sqlx::query(
            "SELECT id, external_id FROM items WHERE account_id = ? AND provider = ? AND status = 'active'",
        )
        .bind(account_id)
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ItemRef {
                    id: row.try_get("id")?,
                    external_id: row.try_get("external_id")?,
                })
            })
            .collect()
    }

    async fn soft_delete(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<u64> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let ts = at.timestamp_micros();

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE items SET status = 'deleted', deleted_at = ");
        qb.push_bind(ts)
            .push(", updated_at = ")
            .push_bind(ts)
            .push(" WHERE status = 'active' AND id IN (");
        let mut separated = qb.separated(", ");
        for id in item_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn get_item(
        &self,
        account_id: &str,
        provider: ProviderKind,
        external_id: &str,
    ) -> Result<Option<Item>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE account_id = ? AND provider = ? AND external_id = ?"
        ))
        .bind(account_id)
        .bind(provider.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    async fn list_items(&self, account_id: &str, query: &ItemQuery) -> Result<Vec<Item>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE account_id = "
        ));
        qb.push_bind(account_id);
        if let Some(provider) = query.provider {
            qb.push(" AND provider = ").push_bind(provider.as_str());
        }
        if !query.include_deleted {
            qb.push(" AND status = 'active'");
        }
        qb.push(" ORDER BY occurred_at DESC, external_id ASC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }
}

#[async_trait]
impl RunLedger for SqliteStore {
    async fn start_run(
        &self,
        account_id: &str,
        provider: ProviderKind,
        started_at: DateTime<Utc>,
    ) -> Result<SyncRun> {
        let run = SyncRun::new_running(account_id, provider, started_at);
        sqlx::query(
            "INSERT INTO sync_runs (id, account_id, provider, status, started_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.account_id)
        .bind(run.provider.as_str())
        .bind(run.status.as_str())
        .bind(started_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to start run for {}/{}", account_id, provider))?;
        Ok(run)
    }

    async fn last_completed_cursor(
        &self,
        account_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<Cursor>> {
        let cursor: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT cursor FROM sync_runs
            WHERE account_id = ? AND provider = ? AND status = 'completed'
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor.flatten().map(Cursor::new))
    }

    async fn finish_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncRun> {
        let (cursor, stats, error) = match outcome {
            RunOutcome::Completed { cursor, stats } => (cursor.as_ref(), stats, None),
            RunOutcome::Failed { stats, error } => (None, stats, Some(error)),
        };

        let result = sqlx::query(
            r#"
            UPDATE sync_runs SET
                status = ?,
                finished_at = ?,
                cursor = ?,
                items_processed = ?,
                items_created = ?,
                items_updated = ?,
                items_deleted = ?,
                error_message = ?,
                error_context = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(outcome.status().as_str())
        .bind(finished_at.timestamp_micros())
        .bind(cursor.map(Cursor::as_str))
        .bind(stats.processed as i64)
        .bind(stats.created as i64)
        .bind(stats.updated as i64)
        .bind(stats.deleted as i64)
        .bind(error.map(|e| e.message.as_str()))
        .bind(error.map(|e| e.context.as_str()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("run '{}' does not exist or is already finished", run_id);
        }

        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?"))
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        row_to_run(&row)
    }

    async fn list_runs(&self, account_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE account_id = ? \
             ORDER BY started_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_account).collect()
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, user_id, oauth_provider, label, access_token,
                                  refresh_token, token_expiry, last_synced_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                oauth_provider = excluded.oauth_provider,
                label = excluded.label,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expiry = excluded.token_expiry,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.oauth_provider.as_str())
        .bind(&account.label)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.token_expiry.map(|t| t.timestamp_micros()))
        .bind(account.last_synced_at.map(|t| t.timestamp_micros()))
        .bind(Utc::now().timestamp_micros())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET access_token = ?, refresh_token = ?, token_expiry = ? WHERE id = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expiry.map(|t| t.timestamp_micros()))
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("account '{}' not found", account_id);
        }
        Ok(())
    }

    async fn mark_synced(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_synced_at = ? WHERE id = ?")
            .bind(at.timestamp_micros())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
