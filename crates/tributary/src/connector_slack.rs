//! Slack connector.
//!
//! Reads `conversations.history` for each configured channel. The cursor
//! keeps, per channel, the `oldest` timestamp to resume from. Slack returns
//! messages newest first, so a walk cut short by the page budget also keeps
//! a `latest` bound: the next fetch fills the gap below it before moving
//! `oldest` forward.
//!
//! Slack reports API failures as `{"ok": false, "error": ...}` with HTTP
//! 200. `invalid_cursor` (or a cursor this connector cannot decode)
//! restarts the fetch from scratch.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use tributary_core::connector::{Connector, FetchPage};
use tributary_core::models::{Cursor, NormalizedRecord, ProviderKind};
use tributary_core::ConnectorError;

use crate::config::SlackConnectorConfig;
use crate::http::{self, ApiClient};

const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const TITLE_MAX_CHARS: usize = 80;

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    has_more: bool,
    error: Option<String>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    ts: String,
    #[serde(default)]
    text: String,
    user: Option<String>,
    subtype: Option<String>,
    thread_ts: Option<String>,
    reply_count: Option<u64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
struct ChannelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oldest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    newest: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct SlackCursor {
    channels: BTreeMap<String, ChannelState>,
}

impl SlackCursor {
    fn encode(&self) -> Cursor {
        Cursor::new(json!(self).to_string())
    }

    fn decode(cursor: &Cursor) -> Option<Self> {
        serde_json::from_str(cursor.as_str()).ok()
    }
}

/// Compare Slack `ts` values (`"1700000000.000100"`) numerically.
fn compare_ts(a: &str, b: &str) -> Ordering {
    fn parts(ts: &str) -> (u64, u64) {
        let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));
        (secs.parse().unwrap_or(0), micros.parse().unwrap_or(0))
    }
    parts(a).cmp(&parts(b))
}

fn max_ts(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if compare_ts(&a, &b) == Ordering::Less { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1000)
}

fn map_api_error(error: String) -> ConnectorError {
    match error.as_str() {
        "invalid_cursor" => ConnectorError::InvalidCursor(error),
        "ratelimited" => ConnectorError::RateLimited { retry_after: None },
        "invalid_auth" | "not_authed" | "token_revoked" | "token_expired" | "account_inactive" => {
            ConnectorError::Unauthorized(error)
        }
        _ => ConnectorError::Provider(error),
    }
}

pub struct SlackConnector {
    api: ApiClient,
    config: SlackConnectorConfig,
}

impl SlackConnector {
    pub fn new(config: SlackConnectorConfig) -> Result<Self> {
        let api = ApiClient::new(&config.http, DEFAULT_BASE_URL)?;
        Ok(Self { api, config })
    }

    /// Walk one channel from `state`. Returns its records, the state to
    /// store and whether the walk reached the end of the history.
    async fn fetch_channel(
        &self,
        token: &str,
        channel: &str,
        state: ChannelState,
        page_size: Option<usize>,
    ) -> Result<(Vec<NormalizedRecord>, ChannelState, bool), ConnectorError> {
        let mut records = Vec::new();
        let mut page_cursor: Option<String> = None;
        let mut newest_seen: Option<String> = None;
        let mut oldest_seen: Option<String> = None;
        let mut drained = false;

        for _ in 0..self.config.max_pages {
            let mut query = vec![
                ("channel", channel.to_string()),
                ("limit", http::page_size(page_size, 200, 999)),
            ];
            if let Some(oldest) = &state.oldest {
                query.push(("oldest", oldest.clone()));
            }
            if let Some(latest) = &state.latest {
                query.push(("latest", latest.clone()));
            }
            if let Some(c) = &page_cursor {
                query.push(("cursor", c.clone()));
            }

            let resp: HistoryResponse = self
                .api
                .get_json(token, "conversations.history", &query)
                .await?;
            if !resp.ok {
                return Err(map_api_error(
                    resp.error.unwrap_or_else(|| "unknown_error".to_string()),
                ));
            }

            for message in resp.messages {
                newest_seen = max_ts(newest_seen, Some(message.ts.clone()));
                oldest_seen = match oldest_seen {
                    Some(o) if compare_ts(&o, &message.ts) != Ordering::Greater => Some(o),
                    _ => Some(message.ts.clone()),
                };
                if let Some(record) = self.message_to_record(channel, message) {
                    records.push(record);
                }
            }

            page_cursor = resp
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty());
            if !resp.has_more || page_cursor.is_none() {
                drained = true;
                break;
            }
        }

        let newest = max_ts(state.newest.clone(), newest_seen);
        let next = if drained {
            ChannelState {
                oldest: newest.clone(),
                latest: None,
                newest,
            }
        } else {
            debug!(channel, "page budget reached; keeping a latest bound");
            ChannelState {
                oldest: state.oldest,
                latest: oldest_seen.or(state.latest),
                newest,
            }
        };
        Ok((records, next, drained))
    }

    fn message_to_record(&self, channel: &str, message: Message) -> Option<NormalizedRecord> {
        match message.subtype.as_deref() {
            None | Some("bot_message") | Some("file_share") | Some("thread_broadcast") => {}
            Some(_) => return None,
        }
        let occurred_at = ts_to_datetime(&message.ts)?;
        let first_line = message.text.lines().next().unwrap_or("").trim();
        let title = if first_line.is_empty() {
            "(message)".to_string()
        } else {
            first_line.chars().take(TITLE_MAX_CHARS).collect()
        };
        let url = format!(
            "{}/archives/{}/p{}",
            self.config.workspace_url.trim_end_matches('/'),
            channel,
            message.ts.replace('.', "")
        );

        Some(
            NormalizedRecord::new(format!("{}:{}", channel, message.ts), title, occurred_at)
                .with_excerpt(Some(&message.text))
                .with_url(Some(url))
                .with_metadata(json!({
                    "channel": channel,
                    "user": message.user,
                    "thread_ts": message.thread_ts,
                    "reply_count": message.reply_count,
                })),
        )
    }

    async fn fetch_all(
        &self,
        token: &str,
        mut state: SlackCursor,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let mut records = Vec::new();
        let mut complete = true;
        let mut next = SlackCursor::default();

        for channel in &self.config.channels {
            let channel_state = state.channels.remove(channel).unwrap_or_default();
            let (mut channel_records, channel_next, drained) = self
                .fetch_channel(token, channel, channel_state, page_size)
                .await?;
            complete &= drained;
            records.append(&mut channel_records);
            next.channels.insert(channel.clone(), channel_next);
        }

        Ok(FetchPage {
            records,
            next_cursor: Some(next.encode()),
            complete,
            restarted: false,
        })
    }
}

#[async_trait]
impl Connector for SlackConnector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Slack
    }

    fn description(&self) -> &str {
        "Slack channel messages (per-channel timestamp cursor)"
    }

    #[instrument(level = "info", skip(self, access_token, cursor), fields(has_cursor = cursor.is_some(), channels = self.config.channels.len()))]
    async fn fetch(
        &self,
        access_token: &str,
        cursor: Option<&Cursor>,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let Some(cursor) = cursor else {
            return self
                .fetch_all(access_token, SlackCursor::default(), page_size)
                .await;
        };
        let Some(state) = SlackCursor::decode(cursor) else {
            warn!("undecodable slack cursor; restarting from scratch");
            return self
                .fetch_all(access_token, SlackCursor::default(), page_size)
                .await
                .map(FetchPage::into_restarted);
        };

        match self.fetch_all(access_token, state, page_size).await {
            Err(ConnectorError::InvalidCursor(reason)) => {
                info!(%reason, "cursor rejected; restarting from scratch");
                self.fetch_all(access_token, SlackCursor::default(), page_size)
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
    fn test_ts_ordering_is_numeric() {
        assert_eq!(compare_ts("999.000001", "1000.000000"), Ordering::Less);
        assert_eq!(compare_ts("1700000000.000200", "1700000000.000100"), Ordering::Greater);
        assert_eq!(
            max_ts(Some("5.1".into()), Some("10.0".into())).as_deref(),
            Some("10.0")
        );
    }

    #[test]
    fn test_ts_to_datetime_keeps_micros() {
        let at = ts_to_datetime("1700000000.000100").unwrap();
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(at.timestamp_subsec_micros(), 100);
    }

    #[test]
    fn test_api_errors_map_to_taxonomy() {
        assert!(matches!(
            map_api_error("invalid_auth".into()),
            ConnectorError::Unauthorized(_)
        ));
        assert!(matches!(
            map_api_error("ratelimited".into()),
            ConnectorError::RateLimited { .. }
        ));
        assert!(matches!(
            map_api_error("channel_not_found".into()),
            ConnectorError::Provider(_)
        ));
    }

    #[test]
    fn test_join_messages_are_skipped() {
        let connector = SlackConnector::new(SlackConnectorConfig::default()).unwrap();
        let message: Message = serde_json::from_value(json!({
            "ts": "1700000000.000100",
            "text": "<@U1> has joined the channel",
            "subtype": "channel_join"
        }))
        .unwrap();
        assert!(connector.message_to_record("C1", message).is_none());

        let message: Message = serde_json::from_value(json!({
            "ts": "1700000000.000200",
            "text": "Deploy is done\nsee thread",
            "user": "U2"
        }))
        .unwrap();
        let record = connector.message_to_record("C1", message).unwrap();
        assert_eq!(record.external_id, "C1:1700000000.000200");
        assert_eq!(record.title, "Deploy is done");
        assert_eq!(
            record.url.as_deref(),
            Some("https://slack.com/archives/C1/p1700000000000200")
        );
    }
}
