//! Sync progress reporting.
//!
//! Reports what the orchestrator is doing during `trib sync`: which
//! provider is being fetched, how many records came back and how each run
//! ended. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts (`trib sync --json`).

use std::io::Write;
use std::sync::Arc;

use tributary_core::models::{ProviderKind, RunStatus};

/// A single progress event for one `(account, provider)` run.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// A run started; `incremental` when a resume cursor was found.
    Fetching {
        account: String,
        provider: ProviderKind,
        incremental: bool,
    },
    /// The connector returned a page.
    Fetched {
        account: String,
        provider: ProviderKind,
        records: u64,
        restarted: bool,
    },
    /// The run reached its terminal state.
    Finished {
        account: String,
        provider: ProviderKind,
        status: RunStatus,
        created: u64,
        updated: u64,
        deleted: Option<u64>,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync acct1/gmail  fetched  1,234 records".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Fetching {
                account,
                provider,
                incremental,
            } => format!(
                "sync {}/{}  fetching ({})\n",
                account,
                provider,
                if *incremental { "incremental" } else { "fresh" }
            ),
            SyncProgressEvent::Fetched {
                account,
                provider,
                records,
                restarted,
            } => format!(
                "sync {}/{}  fetched  {} records{}\n",
                account,
                provider,
                format_number(*records),
                if *restarted { " (cursor rejected, restarted)" } else { "" }
            ),
            SyncProgressEvent::Finished {
                account,
                provider,
                status,
                created,
                updated,
                deleted,
            } => {
                let deleted = deleted
                    .map(|d| format!(", {} deleted", format_number(d)))
                    .unwrap_or_default();
                format!(
                    "sync {}/{}  {}  {} created, {} updated{}\n",
                    account,
                    provider,
                    status.as_str(),
                    format_number(*created),
                    format_number(*updated),
                    deleted
                )
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn event_json(event: &SyncProgressEvent) -> serde_json::Value {
    match event {
        SyncProgressEvent::Fetching {
            account,
            provider,
            incremental,
        } => serde_json::json!({
            "event": "progress",
            "account": account,
            "provider": provider,
            "phase": "fetching",
            "incremental": incremental
        }),
        SyncProgressEvent::Fetched {
            account,
            provider,
            records,
            restarted,
        } => serde_json::json!({
            "event": "progress",
            "account": account,
            "provider": provider,
            "phase": "fetched",
            "records": records,
            "restarted": restarted
        }),
        SyncProgressEvent::Finished {
            account,
            provider,
            status,
            created,
            updated,
            deleted,
        } => serde_json::json!({
            "event": "progress",
            "account": account,
            "provider": provider,
            "phase": "finished",
            "status": status,
            "created": created,
            "updated": updated,
            "deleted": deleted
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
