//! Error types for the synchronization engine.
//!
//! Two layers of failure exist. [`SyncError`] is fatal for an account's whole
//! sync cycle and is the only error that escapes `sync_account`.
//! [`ConnectorError`] is fatal for a single provider's run; the orchestrator
//! captures it into the run ledger and moves on to the next provider.

use std::time::Duration;

use thiserror::Error;

/// Account-level failure: nothing was synced.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("account '{0}' not found")]
    AccountNotFound(String),

    /// The access token is expired and there is no refresh token.
    /// The user has to reconnect the account.
    #[error("credentials for account '{account_id}' expired and cannot be refreshed")]
    CredentialExpired { account_id: String },

    /// Exchanging the refresh token failed (revoked consent, network error).
    #[error("refreshing credentials for account '{account_id}' failed: {message}")]
    CredentialRefreshFailed { account_id: String, message: String },

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl SyncError {
    /// Whether the user must reconnect the account before syncing again.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            SyncError::CredentialExpired { .. } | SyncError::CredentialRefreshFailed { .. }
        )
    }
}

/// Failure while fetching a page from a provider.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// The resume cursor is no longer accepted by the provider.
    ///
    /// Connectors recover from this internally by restarting from scratch;
    /// it only escapes when the restart itself reports it again.
    #[error("cursor rejected by provider: {0}")]
    InvalidCursor(String),

    #[error("provider rejected the access token: {0}")]
    Unauthorized(String),

    #[error("rate limited by provider{}", retry_after.as_ref().map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Provider-level error reported inside a successful HTTP response.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}
