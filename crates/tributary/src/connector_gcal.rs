//! Google Calendar connector.
//!
//! Lists expanded (`singleEvents=true`) events of one calendar. A fresh
//! listing starts `lookback_days` in the past (`0` means no lower bound);
//! once Google hands back a `nextSyncToken` on the last page, later fetches
//! are incremental and pass only that token. A listing that hits the page
//! budget stores its page token and continues on the next fetch.
//!
//! Sync-token fetches report changes anywhere in the calendar, so only an
//! unbounded fresh listing that reached its sync token is `complete`. A
//! bounded one would soft-delete older events delivered incrementally.
//!
//! Google answers 410 Gone when a sync token has expired; the connector
//! then restarts with a fresh listing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use tributary_core::connector::{Connector, FetchPage};
use tributary_core::models::{Cursor, NormalizedRecord, ProviderKind};
use tributary_core::ConnectorError;

use crate::config::CalendarConnectorConfig;
use crate::http::{self, ApiClient};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<Event>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "nextSyncToken")]
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Event {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    #[serde(rename = "htmlLink")]
    html_link: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
    created: Option<DateTime<Utc>>,
    organizer: Option<Person>,
    #[serde(default)]
    attendees: Vec<Person>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EventTime {
    #[serde(rename = "dateTime", skip_serializing_if = "Option::is_none")]
    date_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<NaiveDate>,
}

impl EventTime {
    fn instant(&self) -> Option<DateTime<Utc>> {
        self.date_time.or_else(|| {
            self.date
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
    }
}

#[derive(Debug, Deserialize)]
struct Person {
    email: Option<String>,
}

/// Private cursor document. Exactly one of the two modes is set.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum CalendarCursor {
    /// A fresh listing stopped at the page budget.
    Listing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_min: Option<String>,
        page_token: String,
    },
    /// Incremental sync, optionally mid-way through its pages.
    Sync {
        sync_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_token: Option<String>,
    },
}

impl CalendarCursor {
    fn encode(&self) -> Cursor {
        Cursor::new(json!(self).to_string())
    }

    fn decode(cursor: &Cursor) -> Option<Self> {
        serde_json::from_str(cursor.as_str()).ok()
    }
}

pub struct CalendarConnector {
    api: ApiClient,
    config: CalendarConnectorConfig,
}

impl CalendarConnector {
    pub fn new(config: CalendarConnectorConfig) -> Result<Self> {
        let api = ApiClient::new(&config.http, DEFAULT_BASE_URL)?;
        Ok(Self { api, config })
    }

    fn events_path(&self) -> String {
        format!("calendars/{}/events", self.config.calendar_id)
    }

    /// Walk pages from `start` until Google returns a sync token or the
    /// page budget runs out. The flag is set when the sync token arrived.
    async fn walk(
        &self,
        token: &str,
        start: CalendarCursor,
        page_size: Option<usize>,
    ) -> Result<(Vec<NormalizedRecord>, CalendarCursor, bool), ConnectorError> {
        let path = self.events_path();
        let mut records = Vec::new();
        let mut state = start;

        for _ in 0..self.config.max_pages {
            let mut query = vec![
                ("singleEvents", "true".to_string()),
                ("maxResults", http::page_size(page_size, 250, 2500)),
            ];
            match &state {
                CalendarCursor::Listing {
                    time_min,
                    page_token,
                } => {
                    if let Some(time_min) = time_min {
                        query.push(("timeMin", time_min.clone()));
                    }
                    if !page_token.is_empty() {
                        query.push(("pageToken", page_token.clone()));
                    }
                }
                CalendarCursor::Sync {
                    sync_token,
                    page_token,
                } => {
                    query.push(("syncToken", sync_token.clone()));
                    if let Some(tok) = page_token {
                        query.push(("pageToken", tok.clone()));
                    }
                }
            }

            let list: EventList = self.api.get_json(token, &path, &query).await?;
            records.extend(list.items.into_iter().filter_map(event_to_record));

            match (list.next_page_token, list.next_sync_token) {
                (Some(next), _) => {
                    state = match state {
                        CalendarCursor::Listing { time_min, .. } => CalendarCursor::Listing {
                            time_min,
                            page_token: next,
                        },
                        CalendarCursor::Sync { sync_token, .. } => CalendarCursor::Sync {
                            sync_token,
                            page_token: Some(next),
                        },
                    };
                }
                (None, Some(sync_token)) => {
                    return Ok((
                        records,
                        CalendarCursor::Sync {
                            sync_token,
                            page_token: None,
                        },
                        true,
                    ));
                }
                (None, None) => {
                    return Err(ConnectorError::Decode(
                        "calendar listing ended without a sync token".to_string(),
                    ));
                }
            }
        }

        Ok((records, state, false))
    }

    async fn fetch_fresh(
        &self,
        token: &str,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let time_min = (self.config.lookback_days > 0).then(|| {
            (Utc::now() - Duration::days(self.config.lookback_days))
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        });
        let bounded = time_min.is_some();
        let start = CalendarCursor::Listing {
            time_min,
            page_token: String::new(),
        };
        let (records, next, reached_sync) = self.walk(token, start, page_size).await?;
        Ok(FetchPage {
            records,
            next_cursor: Some(next.encode()),
            complete: reached_sync && !bounded,
            restarted: false,
        })
    }
}

fn event_to_record(event: Event) -> Option<NormalizedRecord> {
    if event.status.as_deref() == Some("cancelled") {
        return None;
    }
    let occurred_at = event
        .start
        .as_ref()
        .and_then(EventTime::instant)
        .or(event.created)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let title = event
        .summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("(no title)")
        .to_string();

    Some(
        NormalizedRecord::new(event.id, title, occurred_at)
            .with_excerpt(event.description.as_deref())
            .with_url(event.html_link)
            .with_metadata(json!({
                "location": event.location,
                "status": event.status,
                "start": event.start,
                "end": event.end,
                "organizer": event.organizer.and_then(|o| o.email),
                "attendees": event.attendees.into_iter().filter_map(|a| a.email).collect::<Vec<_>>(),
            })),
    )
}

#[async_trait]
impl Connector for CalendarConnector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleCalendar
    }

    fn description(&self) -> &str {
        "Google Calendar events (sync-token incremental sync)"
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
        let Some(state) = CalendarCursor::decode(cursor) else {
            warn!("undecodable calendar cursor; restarting from scratch");
            return self
                .fetch_fresh(access_token, page_size)
                .await
                .map(FetchPage::into_restarted);
        };

        match self.walk(access_token, state, page_size).await {
            Ok((records, next, _)) => Ok(FetchPage {
                records,
                next_cursor: Some(next.encode()),
                complete: false,
                restarted: false,
            }),
            Err(e) if http::is_status(&e, &[410]) => {
                info!(error = %e, "sync token expired; restarting from scratch");
                self.fetch_fresh(access_token, page_size)
                    .await
                    .map(FetchPage::into_restarted)
            }
            Err(e) => Err(e),
        }
    }
}
