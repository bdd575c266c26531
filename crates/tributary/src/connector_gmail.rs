//! Gmail connector.
//!
//! A fresh fetch snapshots the mailbox `historyId`, then lists messages
//! matching the configured query (newest first, up to `max_pages` pages)
//! and reads each message's metadata.
//!
//! An incremental fetch walks `users.history.list` from the stored history
//! id and reads every message added since, whatever its labels. Gmail
//! answers 404 once a history id is too old; the connector then restarts
//! with a fresh fetch.
//!
//! Because the history walk is unscoped, a fresh listing only counts as
//! `complete` when the query is empty (the listing then includes spam and
//! trash) and Gmail ran out of pages within the budget. A scoped listing
//! never drives deletions, or mail that arrived through history outside
//! the query would be soft-deleted.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use tributary_core::connector::{Connector, FetchPage};
use tributary_core::models::{Cursor, NormalizedRecord, ProviderKind};
use tributary_core::ConnectorError;

use crate::config::GmailConnectorConfig;
use crate::http::{self, ApiClient};

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryList {
    #[serde(rename = "historyId")]
    history_id: Option<String>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

/// Private cursor document.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct GmailCursor {
    history_id: String,
    /// Set when the previous history walk stopped at the page budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    page_token: Option<String>,
}

impl GmailCursor {
    fn encode(&self) -> Cursor {
        Cursor::new(json!(self).to_string())
    }

    fn decode(cursor: &Cursor) -> Option<Self> {
        serde_json::from_str(cursor.as_str()).ok()
    }
}

pub struct GmailConnector {
    api: ApiClient,
    config: GmailConnectorConfig,
}

impl GmailConnector {
    pub fn new(config: GmailConnectorConfig) -> Result<Self> {
        let api = ApiClient::new(&config.http, DEFAULT_BASE_URL)?;
        Ok(Self { api, config })
    }

    async fn fetch_fresh(
        &self,
        token: &str,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        // Snapshot first so nothing delivered during the listing is missed.
        let profile: Profile = self.api.get_json(token, "users/me/profile", &[]).await?;
        if profile.history_id.trim().is_empty() {
            return Err(ConnectorError::Decode(
                "gmail profile missing historyId".to_string(),
            ));
        }

        let unscoped = self.config.query.trim().is_empty();
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut drained = false;
        for _ in 0..self.config.max_pages {
            let mut query = vec![("maxResults", http::page_size(page_size, 100, 500))];
            if unscoped {
                query.push(("includeSpamTrash", "true".to_string()));
            } else {
                query.push(("q", self.config.query.clone()));
            }
            if let Some(tok) = &page_token {
                query.push(("pageToken", tok.clone()));
            }
            let list: MessageList = self.api.get_json(token, "users/me/messages", &query).await?;
            ids.extend(list.messages.into_iter().map(|m| m.id));
            page_token = list.next_page_token;
            if page_token.is_none() {
                drained = true;
                break;
            }
        }
        if drained && !unscoped {
            debug!(query = %self.config.query, "scoped listing drained; not treated as complete");
        }

        let records = self.read_messages(token, ids).await?;
        Ok(FetchPage {
            records,
            next_cursor: Some(
                GmailCursor {
                    history_id: profile.history_id,
                    page_token: None,
                }
                .encode(),
            ),
            complete: drained && unscoped,
            restarted: false,
        })
    }

    async fn fetch_incremental(
        &self,
        token: &str,
        state: GmailCursor,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let mut ids = Vec::new();
        let mut page_token = state.page_token.clone();
        let mut latest_history_id: Option<String> = None;
        let mut drained = false;

        for _ in 0..self.config.max_pages {
            let mut query = vec![
                ("startHistoryId", state.history_id.clone()),
                ("historyTypes", "messageAdded".to_string()),
                ("maxResults", http::page_size(page_size, 100, 500)),
            ];
            if let Some(tok) = &page_token {
                query.push(("pageToken", tok.clone()));
            }
            let list: HistoryList = self.api.get_json(token, "users/me/history", &query).await?;
            latest_history_id = list.history_id.or(latest_history_id);
            ids.extend(
                list.history
                    .into_iter()
                    .flat_map(|h| h.messages_added)
                    .map(|added| added.message.id),
            );
            page_token = list.next_page_token;
            if page_token.is_none() {
                drained = true;
                break;
            }
        }

        let next = if drained {
            GmailCursor {
                history_id: latest_history_id.unwrap_or(state.history_id),
                page_token: None,
            }
        } else {
            GmailCursor {
                history_id: state.history_id,
                page_token,
            }
        };

        let records = self.read_messages(token, ids).await?;
        Ok(FetchPage {
            records,
            next_cursor: Some(next.encode()),
            complete: false,
            restarted: false,
        })
    }

    async fn read_messages(
        &self,
        token: &str,
        ids: Vec<String>,
    ) -> Result<Vec<NormalizedRecord>, ConnectorError> {
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            let path = format!("users/me/messages/{}", id);
            let query = [
                ("format", "metadata".to_string()),
                ("metadataHeaders", "From".to_string()),
                ("metadataHeaders", "To".to_string()),
                ("metadataHeaders", "Subject".to_string()),
            ];
            match self.api.get_json::<Message>(token, &path, &query).await {
                Ok(message) => records.push(message_to_record(message)),
                // Deleted between listing and read.
                Err(e) if http::is_status(&e, &[404]) => {
                    debug!(message_id = %id, "message vanished before it could be read")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

fn header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn message_to_record(message: Message) -> NormalizedRecord {
    let headers = message.payload.map(|p| p.headers).unwrap_or_default();
    let subject = header(&headers, "Subject")
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("(no subject)");
    let occurred_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        // Stable so an undated message keeps its content hash across runs.
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    NormalizedRecord::new(message.id.clone(), subject, occurred_at)
        .with_excerpt(message.snippet.as_deref())
        .with_url(Some(format!(
            "https://mail.google.com/mail/u/0/#all/{}",
            message.id
        )))
        .with_metadata(json!({
            "from": header(&headers, "From"),
            "to": header(&headers, "To"),
            "thread_id": message.thread_id,
            "labels": message.label_ids,
        }))
}

#[async_trait]
impl Connector for GmailConnector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn description(&self) -> &str {
        "Gmail messages (history-id incremental sync)"
    }

    #[instrument(level = "info", skip(self, access_token, cursor), fields(has_cursor = cursor.is_some()))]
    async fn fetch(
        &self,
        access_token: &str,
        cursor: Option<&Cursor>,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let Some(cursor) = cursor else {
            return self.fetch_fresh(access_token, page_size).await;
        };

        let Some(state) = GmailCursor::decode(cursor) else {
            warn!("undecodable gmail cursor; restarting from scratch");
            return self
                .fetch_fresh(access_token, page_size)
                .await
                .map(FetchPage::into_restarted);
        };

        match self.fetch_incremental(access_token, state, page_size).await {
            Err(e) if http::is_status(&e, &[404]) || matches!(e, ConnectorError::InvalidCursor(_)) => {
                info!(error = %e, "history id rejected; restarting from scratch");
                self.fetch_fresh(access_token, page_size)
                    .await
                    .map(FetchPage::into_restarted)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_to_record() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX"],
            "snippet": "Quarterly   numbers attached",
            "internalDate": "1700000000000",
            "payload": {"headers": [
                {"name": "Subject", "value": "Q3 report"},
                {"name": "from", "value": "boss@example.com"}
            ]}
        }))
        .unwrap();

        let record = message_to_record(message);
        assert_eq!(record.external_id, "m1");
        assert_eq!(record.title, "Q3 report");
        assert_eq!(record.excerpt.as_deref(), Some("Quarterly numbers attached"));
        assert_eq!(record.occurred_at.timestamp(), 1_700_000_000);
        assert_eq!(record.metadata["from"], "boss@example.com");
        assert_eq!(record.metadata["labels"][0], "INBOX");
    }

    #[test]
    fn test_missing_subject_gets_placeholder() {
        let message: Message = serde_json::from_value(json!({"id": "m2"})).unwrap();
        assert_eq!(message_to_record(message).title, "(no subject)");
    }

    #[test]
    fn test_undated_message_hashes_the_same_every_time() {
        let read = || {
            let message: Message =
                serde_json::from_value(json!({"id": "m3", "snippet": "no date"})).unwrap();
            message_to_record(message)
        };
        let (first, second) = (read(), read());
        assert_eq!(first.occurred_at, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(first.content_hash(), second.content_hash());
    }

    #[test]
    fn test_cursor_decode_rejects_foreign_json() {
        assert!(GmailCursor::decode(&Cursor::new("not json")).is_none());
        assert!(GmailCursor::decode(&Cursor::new(r#"{"sync_token":"x"}"#)).is_none());
        let c = GmailCursor {
            history_id: "42".into(),
            page_token: None,
        };
        assert_eq!(GmailCursor::decode(&c.encode()), Some(c));
    }
}
