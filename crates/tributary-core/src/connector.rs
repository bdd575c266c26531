//! Connector contract and registry.
//!
//! A connector adapts one provider's API to a single operation: fetch one
//! page of [`NormalizedRecord`]s given an access token and an optional
//! resume [`Cursor`]. Connectors are pure with respect to Tributary's state;
//! they never touch the store or the ledger.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌───────┐ ┌──────────┐ ┌──────┐ ┌─────┐ │
//! │  │ Gmail │ │ Calendar │ │Drive │ │Slack│ │
//! │  └───────┘ └──────────┘ └──────┘ └─────┘ │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        sync_account() → merge → reconcile
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::models::{Cursor, NormalizedRecord, ProviderKind};

/// Result of one [`Connector::fetch`] call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchPage {
    pub records: Vec<NormalizedRecord>,
    /// Resume point for the next fetch. `None` ends this sync line: the
    /// next fetch lists from scratch.
    pub next_cursor: Option<Cursor>,
    /// The connector reached the provider's end-of-listing signal during
    /// this fetch, so `records` is everything the provider currently has
    /// in scope. Only meaningful for fetches made without a cursor.
    pub complete: bool,
    /// The supplied cursor was rejected and the fetch restarted from scratch.
    pub restarted: bool,
}

impl FetchPage {
    pub fn external_ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.external_id.as_str())
    }

    /// Mark a page produced by restarting after a rejected cursor.
    pub fn into_restarted(mut self) -> Self {
        self.restarted = true;
        self
    }
}

/// A provider adapter that produces normalized records.
///
/// # Cursor recovery
///
/// When a provider rejects the supplied cursor (expired sync token, unknown
/// history id, malformed cursor), the connector must restart the fetch as
/// if no cursor had been given and set [`FetchPage::restarted`], rather
/// than returning [`ConnectorError::InvalidCursor`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// The provider this connector fetches from.
    fn kind(&self) -> ProviderKind;

    /// One-line description, shown by the CLI.
    fn description(&self) -> &str;

    /// Fetch the next page of records.
    async fn fetch(
        &self,
        access_token: &str,
        cursor: Option<&Cursor>,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError>;
}

/// Maps each [`ProviderKind`] to its connector implementation.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<ProviderKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector, replacing any previous one for the same kind.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.kind(), connector);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&kind).cloned()
    }

    /// Registered kinds, in a stable order.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.connectors.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}
