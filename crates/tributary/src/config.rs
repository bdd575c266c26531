//! Configuration parsing and validation.
//!
//! Tributary is configured with a TOML file (default `./config/trib.toml`).
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/trib.sqlite"
//!
//! [sync]
//! batch_size = 50
//! token_skew_secs = 300
//! fetch_timeout_secs = 60
//! page_size = 100
//!
//! [oauth.google]
//! client_id = "1234.apps.googleusercontent.com"
//! client_secret = "..."
//!
//! [connectors.slack]
//! channels = ["C0123456"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tributary_core::models::OAuthProvider;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub oauth: OAuthConfigs,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Records written per merge / soft-delete chunk.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Refresh tokens this many seconds before they expire.
    #[serde(default = "default_token_skew_secs")]
    pub token_skew_secs: i64,
    /// Upper bound on one connector fetch.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Page size hint passed to connectors.
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            token_skew_secs: default_token_skew_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            page_size: None,
        }
    }
}

fn default_batch_size() -> usize {
    tributary_core::merge::DEFAULT_BATCH_SIZE
}
fn default_token_skew_secs() -> i64 {
    tributary_core::token::DEFAULT_TOKEN_SKEW_SECS
}
fn default_fetch_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OAuthConfigs {
    pub google: Option<OAuthClientConfig>,
    pub slack: Option<OAuthClientConfig>,
}

impl OAuthConfigs {
    pub fn get(&self, provider: OAuthProvider) -> Option<&OAuthClientConfig> {
        match provider {
            OAuthProvider::Google => self.google.as_ref(),
            OAuthProvider::Slack => self.slack.as_ref(),
        }
    }
}

/// OAuth client registration used for refresh-token grants.
#[derive(Debug, Deserialize, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Overrides the provider's default token endpoint.
    #[serde(default)]
    pub token_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub gmail: GmailConnectorConfig,
    #[serde(default)]
    pub google_calendar: CalendarConnectorConfig,
    #[serde(default)]
    pub google_drive: DriveConnectorConfig,
    #[serde(default)]
    pub slack: SlackConnectorConfig,
}

/// Settings shared by every HTTP connector.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HttpSettings {
    /// API root, overridable for testing against a mock server.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GmailConnectorConfig {
    #[serde(flatten)]
    pub http: HttpSettings,
    /// Gmail search query scoping the fresh listing. Only an empty query
    /// lets a fresh listing soft-delete vanished messages.
    #[serde(default = "default_gmail_query")]
    pub query: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for GmailConnectorConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            query: default_gmail_query(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_gmail_query() -> String {
    "in:inbox".to_string()
}
fn default_max_pages() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalendarConnectorConfig {
    #[serde(flatten)]
    pub http: HttpSettings,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    /// How far back a fresh listing reaches. `0` lists the whole calendar,
    /// which is the only setting that lets a fresh listing soft-delete
    /// vanished events.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for CalendarConnectorConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            calendar_id: default_calendar_id(),
            lookback_days: default_lookback_days(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_calendar_id() -> String {
    "primary".to_string()
}
fn default_lookback_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConnectorConfig {
    #[serde(flatten)]
    pub http: HttpSettings,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for DriveConnectorConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConnectorConfig {
    #[serde(flatten)]
    pub http: HttpSettings,
    /// Channel ids to sync.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Workspace URL used to build message permalinks.
    #[serde(default = "default_slack_workspace_url")]
    pub workspace_url: String,
}

impl Default for SlackConnectorConfig {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            channels: Vec::new(),
            max_pages: default_max_pages(),
            workspace_url: default_slack_workspace_url(),
        }
    }
}

fn default_slack_workspace_url() -> String {
    "https://slack.com".to_string()
}

impl Config {
    /// A configuration with only a database path, everything else default.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            sync: SyncConfig::default(),
            oauth: OAuthConfigs::default(),
            connectors: ConnectorsConfig::default(),
        }
    }

    /// Fetch timeout per connector run.
    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.fetch_timeout_secs)
    }
}

/// Parse and validate a configuration string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Read, parse and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.sync.batch_size == 0 {
        bail!("sync.batch_size must be > 0");
    }
    if config.sync.token_skew_secs < 0 {
        bail!("sync.token_skew_secs must be >= 0");
    }
    if config.sync.fetch_timeout_secs == 0 {
        bail!("sync.fetch_timeout_secs must be > 0");
    }
    if config.sync.page_size == Some(0) {
        bail!("sync.page_size must be > 0 when set");
    }

    let pages: HashMap<&str, usize> = HashMap::from([
        ("gmail", config.connectors.gmail.max_pages),
        ("google_calendar", config.connectors.google_calendar.max_pages),
        ("google_drive", config.connectors.google_drive.max_pages),
        ("slack", config.connectors.slack.max_pages),
    ]);
    for (name, max_pages) in pages {
        if max_pages == 0 {
            bail!("connectors.{}.max_pages must be > 0", name);
        }
    }
    if config.connectors.google_calendar.lookback_days < 0 {
        bail!("connectors.google_calendar.lookback_days must be >= 0");
    }

    for (name, client) in [
        ("google", config.oauth.google.as_ref()),
        ("slack", config.oauth.slack.as_ref()),
    ] {
        if let Some(client) = client {
            if client.client_id.trim().is_empty() {
                bail!("oauth.{}.client_id must not be empty", name);
            }
        }
    }

    Ok(())
}
