//! Merge Engine: upserts a page of normalized records into the item store.
//!
//! Records are keyed by `(account, provider, external id)`. Each chunk of
//! the page does one batched existence lookup, then inserts the new keys
//! and overwrites the existing ones. Chunks are independent: a chunk that
//! fails to write is reported and skipped, and later chunks still run.
//!
//! Re-applying the same page is a no-op apart from `updated_at`: every
//! record is an update and nothing is created.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::models::{ItemWrite, NormalizedRecord, ProviderKind};
use crate::store::ItemStore;

/// Default number of records written per chunk.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// A chunk whose writes failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    /// Zero-based chunk position within the page.
    pub chunk: usize,
    /// Records of the chunk that were not written.
    pub records: usize,
    pub message: String,
}

/// Outcome of [`MergeEngine::upsert`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub created: u64,
    pub updated: u64,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl MergeReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_chunks.is_empty()
    }

    pub fn written(&self) -> u64 {
        self.created + self.updated
    }
}

pub struct MergeEngine {
    store: Arc<dyn ItemStore>,
    batch_size: usize,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the chunk size. Values below 1 are clamped to 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Upsert `records` for the pair. Never fails as a whole; chunk-level
    /// write failures are returned in [`MergeReport::failed_chunks`].
    #[tracing::instrument(level = "debug", skip(self, records), fields(records = records.len()))]
    pub async fn upsert(
        &self,
        account_id: &str,
        provider: ProviderKind,
        records: Vec<NormalizedRecord>,
    ) -> MergeReport {
        let writes: Vec<ItemWrite> = dedupe_last_wins(records)
            .into_iter()
            .map(|record| ItemWrite::new(account_id, provider, record))
            .collect();

        let mut report = MergeReport::default();
        for (index, chunk) in writes.chunks(self.batch_size).enumerate() {
            let mut written = 0;
            if let Err(e) = self
                .write_chunk(account_id, provider, chunk, &mut report, &mut written)
                .await
            {
                let unwritten = chunk.len() - written;
                warn!(
                    chunk = index,
                    records = unwritten,
                    error = %format!("{:#}", e),
                    "merge chunk failed; continuing with next chunk"
                );
                report.failed_chunks.push(ChunkFailure {
                    chunk: index,
                    records: unwritten,
                    message: format!("{:#}", e),
                });
            }
        }

        debug!(
            created = report.created,
            updated = report.updated,
            failed_chunks = report.failed_chunks.len(),
            "merge finished"
        );
        report
    }

    /// Write one chunk, counting each step into `report` as soon as it is
    /// persisted so a later failure does not hide earlier writes.
    async fn write_chunk(
        &self,
        account_id: &str,
        provider: ProviderKind,
        chunk: &[ItemWrite],
        report: &mut MergeReport,
        written: &mut usize,
    ) -> Result<()> {
        let ids: Vec<String> = chunk
            .iter()
            .map(|w| w.record.external_id.clone())
            .collect();
        let existing = self
            .store
            .existing_external_ids(account_id, provider, &ids)
            .await?;

        let (to_update, to_insert): (Vec<ItemWrite>, Vec<ItemWrite>) = chunk
            .iter()
            .cloned()
            .partition(|w| existing.contains(&w.record.external_id));

        if !to_insert.is_empty() {
            self.store.insert_items(&to_insert).await?;
            report.created += to_insert.len() as u64;
            *written += to_insert.len();
        }
        if !to_update.is_empty() {
            report.updated += self.store.update_items(&to_update).await?;
            *written += to_update.len();
        }
        Ok(())
    }
}

/// Collapse repeated external ids to their last occurrence, keeping the
/// position of the first.
fn dedupe_last_wins(records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<NormalizedRecord> = Vec::with_capacity(records.len());
    for record in records {
        match position.get(&record.external_id) {
            Some(&idx) => out[idx] = record,
            None => {
                position.insert(record.external_id.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, ItemRef, ItemStatus};
    use crate::store::memory::InMemoryStore;
    use crate::store::ItemQuery;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashSet;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn record(ext: &str, title: &str) -> NormalizedRecord {
        NormalizedRecord::new(ext, title, at(9))
            .with_excerpt(Some("snippet"))
            .with_metadata(serde_json::json!({ "from": "a@example.com" }))
    }

    fn page(n: usize) -> Vec<NormalizedRecord> {
        (0..n)
            .map(|i| record(&format!("m{i}"), &format!("Message {i}")))
            .collect()
    }

    async fn snapshot(store: &InMemoryStore) -> Vec<Item> {
        let mut items = store
            .list_items(
                "acct1",
                &ItemQuery {
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        items.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        items
    }

    #[tokio::test]
    async fn test_first_merge_creates_everything() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone());

        let report = engine.upsert("acct1", ProviderKind::Gmail, page(3)).await;
        assert_eq!(report.created, 3);
        assert_eq!(report.updated, 0);
        assert!(!report.is_partial());
        assert_eq!(store.item_count("acct1"), 3);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone()).with_batch_size(2);

        let first = engine.upsert("acct1", ProviderKind::Gmail, page(5)).await;
        assert_eq!(first.created, 5);
        let before = snapshot(&store).await;

        let second = engine.upsert("acct1", ProviderKind::Gmail, page(5)).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 5);

        let after = snapshot(&store).await;
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.title, a.title);
            assert_eq!(b.content_hash, a.content_hash);
            assert_eq!(b.metadata, a.metadata);
            assert_eq!(a.status, ItemStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_update_overwrites_fields() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone());
        engine
            .upsert("acct1", ProviderKind::Gmail, vec![record("m1", "Old")])
            .await;

        let mut changed = NormalizedRecord::new("m1", "New", at(11));
        changed.metadata = serde_json::json!({ "labels": ["INBOX"] });
        let report = engine
            .upsert("acct1", ProviderKind::Gmail, vec![changed])
            .await;
        assert_eq!(report.updated, 1);

        let item = store
            .get_item("acct1", ProviderKind::Gmail, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.title, "New");
        assert_eq!(item.excerpt, None);
        assert_eq!(item.occurred_at, at(11));
        assert_eq!(item.metadata, serde_json::json!({ "labels": ["INBOX"] }));
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_page_collapse_to_last() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone()).with_batch_size(1);

        let report = engine
            .upsert(
                "acct1",
                ProviderKind::Slack,
                vec![record("x", "first"), record("y", "other"), record("x", "second")],
            )
            .await;
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 0);
        let item = store
            .get_item("acct1", ProviderKind::Slack, "x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.title, "second");
    }

    #[tokio::test]
    async fn test_same_external_id_is_distinct_across_providers_and_accounts() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone());

        engine
            .upsert("acct1", ProviderKind::Gmail, vec![record("id1", "a")])
            .await;
        let r = engine
            .upsert("acct1", ProviderKind::GoogleDrive, vec![record("id1", "b")])
            .await;
        assert_eq!(r.created, 1);
        let r = engine
            .upsert("acct2", ProviderKind::Gmail, vec![record("id1", "c")])
            .await;
        assert_eq!(r.created, 1);
        assert_eq!(store.item_count("acct1"), 2);
        assert_eq!(store.item_count("acct2"), 1);
    }

    #[tokio::test]
    async fn test_soft_deleted_item_is_resurrected() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone());
        engine
            .upsert("acct1", ProviderKind::Gmail, vec![record("m1", "Hello")])
            .await;
        let original = store
            .get_item("acct1", ProviderKind::Gmail, "m1")
            .await
            .unwrap()
            .unwrap();
        store.soft_delete(&[original.id.clone()], at(12)).await.unwrap();

        let report = engine
            .upsert("acct1", ProviderKind::Gmail, vec![record("m1", "Hello again")])
            .await;
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 1);

        let item = store
            .get_item("acct1", ProviderKind::Gmail, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.id, original.id);
        assert_eq!(item.status, ItemStatus::Active);
        assert_eq!(item.deleted_at, None);
        assert_eq!(item.title, "Hello again");
        assert_eq!(store.item_count("acct1"), 1);
    }

    /// Delegates to an in-memory store but refuses writes containing a poison id.
    struct PoisonedStore {
        inner: InMemoryStore,
        poison: String,
    }

    #[async_trait]
    impl ItemStore for PoisonedStore {
        async fn existing_external_ids(
            &self,
            account_id: &str,
            provider: ProviderKind,
            external_ids: &[String],
        ) -> Result<HashSet<String>> {
            self.inner
                .existing_external_ids(account_id, provider, external_ids)
                .await
        }

        async fn insert_items(&self, items: &[ItemWrite]) -> Result<()> {
            if items.iter().any(|w| w.record.external_id == self.poison) {
                anyhow::bail!("row too large");
            }
            self.inner.insert_items(items).await
        }

        async fn update_items(&self, items: &[ItemWrite]) -> Result<u64> {
            if items.iter().any(|w| w.record.external_id == self.poison) {
                anyhow::bail!("database is locked");
            }
            self.inner.update_items(items).await
        }

        async fn list_active(
            &self,
            account_id: &str,
            provider: ProviderKind,
        ) -> Result<Vec<ItemRef>> {
            self.inner.list_active(account_id, provider).await
        }

        async fn soft_delete(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<u64> {
            self.inner.soft_delete(item_ids, at).await
        }

        async fn get_item(
            &self,
            account_id: &str,
            provider: ProviderKind,
            external_id: &str,
        ) -> Result<Option<Item>> {
            self.inner.get_item(account_id, provider, external_id).await
        }

        async fn list_items(&self, account_id: &str, query: &ItemQuery) -> Result<Vec<Item>> {
            self.inner.list_items(account_id, query).await
        }
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_later_chunks() {
        let store = Arc::new(PoisonedStore {
            inner: InMemoryStore::new(),
            poison: "m2".to_string(),
        });
        let engine = MergeEngine::new(store.clone()).with_batch_size(2);

        // Chunks: [m0, m1] [m2, m3] [m4]
        let report = engine.upsert("acct1", ProviderKind::Gmail, page(5)).await;
        assert_eq!(report.created, 3);
        assert_eq!(
            report.failed_chunks,
            vec![ChunkFailure {
                chunk: 1,
                records: 2,
                message: "row too large".to_string(),
            }]
        );
        assert!(report.is_partial());
        assert!(store
            .get_item("acct1", ProviderKind::Gmail, "m4")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_item("acct1", ProviderKind::Gmail, "m3")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inserts_are_counted_when_update_of_same_chunk_fails() {
        let store = Arc::new(PoisonedStore {
            inner: InMemoryStore::new(),
            poison: "m1".to_string(),
        });
        store
            .inner
            .insert_items(&[ItemWrite::new("acct1", ProviderKind::Gmail, record("m1", "old"))])
            .await
            .unwrap();
        let engine = MergeEngine::new(store.clone());

        // One chunk: m0 is new, m1 exists and its update fails.
        let report = engine.upsert("acct1", ProviderKind::Gmail, page(2)).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.written(), 1);
        assert_eq!(
            report.failed_chunks,
            vec![ChunkFailure {
                chunk: 0,
                records: 1,
                message: "database is locked".to_string(),
            }]
        );
        assert!(store
            .get_item("acct1", ProviderKind::Gmail, "m0")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_empty_page_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MergeEngine::new(store.clone());
        let report = engine.upsert("acct1", ProviderKind::Gmail, vec![]).await;
        assert_eq!(report, MergeReport::default());
    }
}
