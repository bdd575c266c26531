//! # Tributary
//!
//! **Incremental synchronization of OAuth-gated sources into one canonical store.**
//!
//! Tributary pulls mail, calendar events, files and chat messages from
//! several providers into a single deduplicated SQLite item store. Each
//! `(account, provider)` pair resumes from the cursor of its last completed
//! run, failures stay isolated to the provider that produced them, and
//! deletions are only inferred from fresh, complete listings.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │   Token    │──▶│  Connectors  │──▶│    Merge    │──▶│  SQLite  │
//! │ Refresher  │   │ Gmail/Cal/…  │   │ + Reconcile │   │  items   │
//! └────────────┘   └──────────────┘   └─────────────┘   └────┬─────┘
//!        ▲                                                   │
//!        └──────────── SyncOrchestrator ◀── run ledger ◀─────┘
//! ```
//!
//! The engine itself (models, traits, Token Refresher, Merge Engine,
//! Deletion Reconciler) lives in `tributary-core`. This crate supplies the
//! SQLite store, the HTTP connectors and token exchanger, the orchestrator
//! and the `trib` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! trib init
//! trib account add acct1 --oauth google --label me@example.com \
//!     --access-token ya29... --refresh-token 1//0g... --expires-in 3599
//! trib sync acct1                      # every Google provider
//! trib sync acct1 --provider gmail
//! trib sync --all --json               # all accounts, concurrently
//! trib runs acct1
//! ```
//!
//! ## Connectors
//!
//! | Provider | Cursor | Module |
//! |----------|--------|--------|
//! | `gmail` | mailbox history id | [`connector_gmail`] |
//! | `google_calendar` | sync token / listing page token | [`connector_gcal`] |
//! | `google_drive` | changes page token / listing page token | [`connector_gdrive`] |
//! | `slack` | per-channel message timestamps | [`connector_slack`] |
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`sqlite_store`] | `ItemStore`, `RunLedger`, `CredentialStore` over SQLite |
//! | [`oauth`] | Refresh-token grant over HTTP |
//! | [`http`] | Shared HTTP client and status mapping for connectors |
//! | [`registry`] | Builds the connector registry from config |
//! | [`orchestrator`] | `SyncOrchestrator::sync_account` |
//! | [`progress`] | Sync progress on stderr (human or JSON) |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`accounts`], [`sync_cmd`], [`runs`], [`items`] | CLI commands |

pub mod accounts;
pub mod config;
pub mod connector_gcal;
pub mod connector_gdrive;
pub mod connector_gmail;
pub mod connector_slack;
pub mod db;
pub mod http;
pub mod items;
pub mod logging;
pub mod migrate;
pub mod oauth;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod runs;
pub mod sqlite_store;
pub mod sync_cmd;

pub use orchestrator::{ProviderError, SyncOrchestrator};
pub use sqlite_store::SqliteStore;
pub use tributary_core::{connector, merge, models, reconcile, store, token};
pub use tributary_core::{ConnectorError, SyncError};
