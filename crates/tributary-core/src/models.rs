//! Core data models shared by every Tributary component.
//!
//! These types describe connected accounts, the normalized records that
//! connectors produce, the canonical items stored after merging, and the
//! run ledger rows that record each synchronization attempt.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum length (in characters) of an item excerpt.
pub const EXCERPT_MAX_CHARS: usize = 280;

/// The OAuth identity provider that issued an account's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthProvider {
    Google,
    Slack,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Slack => "slack",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OAuthProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(OAuthProvider::Google),
            "slack" => Ok(OAuthProvider::Slack),
            other => anyhow::bail!("Unknown OAuth provider: '{}'. Must be google or slack.", other),
        }
    }
}

/// A content source that can be synchronized for an account.
///
/// The kind is part of every canonical item's identity key, so its string
/// form must never change once items have been stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Mail messages.
    Gmail,
    /// Calendar events.
    GoogleCalendar,
    /// Files in cloud storage.
    GoogleDrive,
    /// Channel messages.
    Slack,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Gmail,
        ProviderKind::GoogleCalendar,
        ProviderKind::GoogleDrive,
        ProviderKind::Slack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::GoogleCalendar => "google_calendar",
            ProviderKind::GoogleDrive => "google_drive",
            ProviderKind::Slack => "slack",
        }
    }

    /// The OAuth provider whose access token this source is fetched with.
    pub fn oauth_provider(&self) -> OAuthProvider {
        match self {
            ProviderKind::Gmail | ProviderKind::GoogleCalendar | ProviderKind::GoogleDrive => {
                OAuthProvider::Google
            }
            ProviderKind::Slack => OAuthProvider::Slack,
        }
    }

    /// All provider kinds that an account from `oauth` can sync.
    pub fn for_oauth_provider(oauth: OAuthProvider) -> Vec<ProviderKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| kind.oauth_provider() == oauth)
            .collect()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gmail" => Ok(ProviderKind::Gmail),
            "google_calendar" => Ok(ProviderKind::GoogleCalendar),
            "google_drive" => Ok(ProviderKind::GoogleDrive),
            "slack" => Ok(ProviderKind::Slack),
            other => anyhow::bail!(
                "Unknown provider: '{}'. Available: gmail, google_calendar, google_drive, slack",
                other
            ),
        }
    }
}

/// One OAuth-connected external identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Owning user.
    pub user_id: String,
    pub oauth_provider: OAuthProvider,
    /// Human-readable label, e.g. an email address or workspace name.
    pub label: String,
    pub access_token: String,
    /// Absent for providers whose tokens never expire.
    pub refresh_token: Option<String>,
    /// Absent when the access token has no expiry.
    pub token_expiry: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Opaque, provider-defined resume point.
///
/// Only the connector that produced a cursor interprets its contents; the
/// engine only ever checks whether one is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record produced by a connector, before it is merged into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Provider-native identifier; stable across syncs.
    pub external_id: String,
    pub title: String,
    pub excerpt: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    /// Real-world occurrence time (sent-at, event start, modified-at).
    pub occurred_at: DateTime<Utc>,
    /// Provider-specific structured metadata. Always a JSON object.
    pub metadata: serde_json::Value,
}

impl NormalizedRecord {
    pub fn new(
        external_id: impl Into<String>,
        title: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            excerpt: None,
            body: None,
            url: None,
            occurred_at,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_excerpt(mut self, excerpt: Option<&str>) -> Self {
        self.excerpt = excerpt.map(truncate_excerpt).filter(|s| !s.is_empty());
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// SHA-256 over every upstream field, used to detect unchanged re-deliveries.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.external_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.title.as_bytes());
        hasher.update([0]);
        hasher.update(self.excerpt.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.body.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.url.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.occurred_at.timestamp_micros().to_le_bytes());
        hasher.update(self.metadata.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Truncate text to [`EXCERPT_MAX_CHARS`] characters, collapsing whitespace.
pub fn truncate_excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_MAX_CHARS {
        return collapsed;
    }
    // Leave room for the ellipsis.
    let cut = collapsed
        .char_indices()
        .nth(EXCERPT_MAX_CHARS - 1)
        .map_or(collapsed.len(), |(idx, _)| idx);
    format!("{}…", &collapsed[..cut])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    /// Soft-deleted: no longer present upstream. The row is kept.
    Deleted,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Active => "active",
            ItemStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ItemStatus::Active),
            "deleted" => Ok(ItemStatus::Deleted),
            other => anyhow::bail!("Unknown item status: '{}'", other),
        }
    }
}

/// A canonical record stored after merging.
///
/// Identity is `(account_id, provider, external_id)`; `id` is a surrogate
/// key that callers must never use to correlate records across syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub account_id: String,
    pub provider: ProviderKind,
    pub external_id: String,
    pub title: String,
    pub excerpt: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub status: ItemStatus,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A record ready to be written to the store under an identity key.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemWrite {
    pub account_id: String,
    pub provider: ProviderKind,
    pub record: NormalizedRecord,
    pub content_hash: String,
}

impl ItemWrite {
    pub fn new(account_id: &str, provider: ProviderKind, record: NormalizedRecord) -> Self {
        let content_hash = record.content_hash();
        Self {
            account_id: account_id.to_string(),
            provider,
            record,
            content_hash,
        }
    }
}

/// Minimal view of an active item, used by deletion reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub id: String,
    pub external_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => anyhow::bail!("Unknown run status: '{}'", other),
        }
    }
}

/// Aggregate counters for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Error captured on a failed run: the provider message plus the step it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    /// Step that failed: `fetch`, `merge`, `reconcile`, `ledger`, ...
    pub context: String,
}

/// One row of the run ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub account_id: String,
    pub provider: ProviderKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cursor: Option<Cursor>,
    pub stats: SyncStats,
    pub error: Option<RunError>,
}

impl SyncRun {
    pub fn new_running(account_id: &str, provider: ProviderKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            provider,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            cursor: None,
            stats: SyncStats::default(),
            error: None,
        }
    }
}

/// Terminal outcome written to a run ledger row.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        cursor: Option<Cursor>,
        stats: SyncStats,
    },
    Failed {
        stats: SyncStats,
        error: RunError,
    },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }
}

/// Per-provider result of `sync_account`, the engine's only output contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSourceResult {
    pub provider: ProviderKind,
    pub status: RunStatus,
    pub items_processed: u64,
    pub items_created: u64,
    pub items_updated: u64,
    /// Present only when deletion reconciliation ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_deleted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
