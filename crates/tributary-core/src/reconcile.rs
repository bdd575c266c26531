//! Deletion Reconciler: soft-deletes items that vanished upstream.
//!
//! Must only be called with the ids of a fresh, complete listing. Against
//! an incremental or truncated listing, "absent" only means "not on this
//! page", and reconciling would soft-delete live records.
//!
//! Soft-deletion is one-way here; a deleted key that shows up again is
//! restored by the Merge Engine, since both key on the same identity.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::merge::DEFAULT_BATCH_SIZE;
use crate::models::ProviderKind;
use crate::store::ItemStore;

pub struct DeletionReconciler {
    store: Arc<dyn ItemStore>,
    batch_size: usize,
}

impl DeletionReconciler {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Soft-delete every active item for the pair whose external id is not
    /// in `current_external_ids`. Returns the number of items deleted.
    ///
    /// Fails only if the active items cannot be listed; a chunk that fails
    /// to soft-delete is logged and skipped.
    #[tracing::instrument(level = "debug", skip(self, current_external_ids), fields(current = current_external_ids.len()))]
    pub async fn reconcile(
        &self,
        account_id: &str,
        provider: ProviderKind,
        current_external_ids: &HashSet<String>,
    ) -> Result<u64> {
        let active = self.store.list_active(account_id, provider).await?;
        let stale: Vec<String> = active
            .into_iter()
            .filter(|item| !current_external_ids.contains(&item.external_id))
            .map(|item| item.id)
            .collect();

        if stale.is_empty() {
            debug!("nothing to reconcile");
            return Ok(0);
        }

        let now = Utc::now();
        let mut deleted = 0;
        for (index, chunk) in stale.chunks(self.batch_size).enumerate() {
            match self.store.soft_delete(chunk, now).await {
                Ok(n) => deleted += n,
                Err(e) => warn!(
                    chunk = index,
                    items = chunk.len(),
                    error = %format!("{:#}", e),
                    "soft-delete chunk failed; continuing"
                ),
            }
        }

        debug!(deleted, "reconciliation finished");
        Ok(deleted)
    }
}
