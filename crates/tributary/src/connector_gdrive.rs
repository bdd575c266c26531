//! Google Drive connector.
//!
//! A fresh fetch snapshots `changes.getStartPageToken`, then lists every
//! non-trashed file. If the listing hits the page budget its page token is
//! kept in the cursor and the listing continues on the next fetch; once it
//! finishes, fetches switch to `changes.list` from the snapshot token.
//!
//! A change token Google no longer accepts (404, or 400 for a malformed
//! token) restarts the fetch with a fresh listing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use tributary_core::connector::{Connector, FetchPage};
use tributary_core::models::{Cursor, NormalizedRecord, ProviderKind};
use tributary_core::ConnectorError;

use crate::config::DriveConnectorConfig;
use crate::http::{self, ApiClient};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const FILE_FIELDS: &str =
    "id,name,mimeType,modifiedTime,createdTime,webViewLink,description,trashed,owners(displayName,emailAddress)";

#[derive(Debug, Deserialize)]
struct StartPageToken {
    #[serde(rename = "startPageToken")]
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<File>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeList {
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "newStartPageToken")]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    removed: bool,
    file: Option<File>,
}

#[derive(Debug, Deserialize)]
struct File {
    id: String,
    name: Option<String>,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<DateTime<Utc>>,
    #[serde(rename = "createdTime")]
    created_time: Option<DateTime<Utc>>,
    #[serde(rename = "webViewLink")]
    web_view_link: Option<String>,
    description: Option<String>,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    owners: Vec<Owner>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "emailAddress")]
    email_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum DriveCursor {
    /// Fresh listing in progress; `start_page_token` was snapshotted first.
    Listing {
        start_page_token: String,
        page_token: String,
    },
    Changes { page_token: String },
}

impl DriveCursor {
    fn encode(&self) -> Cursor {
        Cursor::new(json!(self).to_string())
    }

    fn decode(cursor: &Cursor) -> Option<Self> {
        serde_json::from_str(cursor.as_str()).ok()
    }
}

pub struct DriveConnector {
    api: ApiClient,
    config: DriveConnectorConfig,
}

impl DriveConnector {
    pub fn new(config: DriveConnectorConfig) -> Result<Self> {
        let api = ApiClient::new(&config.http, DEFAULT_BASE_URL)?;
        Ok(Self { api, config })
    }

    /// Page through `files.list`. Returns the records, the cursor to store
    /// and whether the listing reached its last page.
    async fn list_files(
        &self,
        token: &str,
        start_page_token: String,
        mut page_token: Option<String>,
        page_size: Option<usize>,
    ) -> Result<(Vec<NormalizedRecord>, DriveCursor, bool), ConnectorError> {
        let mut records = Vec::new();
        for _ in 0..self.config.max_pages {
            let mut query = vec![
                ("q", "trashed = false".to_string()),
                ("pageSize", http::page_size(page_size, 100, 1000)),
                ("fields", format!("nextPageToken,files({})", FILE_FIELDS)),
            ];
            if let Some(tok) = &page_token {
                query.push(("pageToken", tok.clone()));
            }
            let list: FileList = self.api.get_json(token, "files", &query).await?;
            records.extend(list.files.into_iter().filter_map(file_to_record));
            page_token = list.next_page_token;
            if page_token.is_none() {
                return Ok((
                    records,
                    DriveCursor::Changes {
                        page_token: start_page_token,
                    },
                    true,
                ));
            }
        }

        let cursor = match page_token {
            Some(page_token) => DriveCursor::Listing {
                start_page_token,
                page_token,
            },
            None => DriveCursor::Changes {
                page_token: start_page_token,
            },
        };
        Ok((records, cursor, false))
    }

    async fn list_changes(
        &self,
        token: &str,
        start: String,
        page_size: Option<usize>,
    ) -> Result<(Vec<NormalizedRecord>, DriveCursor), ConnectorError> {
        let mut records = Vec::new();
        let mut page_token = start;
        for _ in 0..self.config.max_pages {
            let query = vec![
                ("pageToken", page_token.clone()),
                ("pageSize", http::page_size(page_size, 100, 1000)),
                (
                    "fields",
                    format!(
                        "nextPageToken,newStartPageToken,changes(removed,file({}))",
                        FILE_FIELDS
                    ),
                ),
            ];
            let list: ChangeList = self.api.get_json(token, "changes", &query).await?;
            records.extend(
                list.changes
                    .into_iter()
                    .filter(|c| !c.removed)
                    .filter_map(|c| c.file)
                    .filter_map(file_to_record),
            );
            match (list.next_page_token, list.new_start_page_token) {
                (Some(next), _) => page_token = next,
                (None, Some(new_start)) => {
                    return Ok((records, DriveCursor::Changes { page_token: new_start }));
                }
                (None, None) => {
                    return Err(ConnectorError::Decode(
                        "changes listing ended without a new start page token".to_string(),
                    ));
                }
            }
        }
        Ok((records, DriveCursor::Changes { page_token }))
    }

    async fn fetch_fresh(
        &self,
        token: &str,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let snapshot: StartPageToken = self
            .api
            .get_json(token, "changes/startPageToken", &[])
            .await?;
        let (records, cursor, complete) = self
            .list_files(token, snapshot.start_page_token, None, page_size)
            .await?;
        Ok(FetchPage {
            records,
            next_cursor: Some(cursor.encode()),
            complete,
            restarted: false,
        })
    }

    async fn fetch_resumed(
        &self,
        token: &str,
        state: DriveCursor,
        page_size: Option<usize>,
    ) -> Result<FetchPage, ConnectorError> {
        let (records, cursor) = match state {
            DriveCursor::Listing {
                start_page_token,
                page_token,
            } => {
                let (records, cursor, _) = self
                    .list_files(token, start_page_token, Some(page_token), page_size)
                    .await?;
                (records, cursor)
            }
            DriveCursor::Changes { page_token } => {
                self.list_changes(token, page_token, page_size).await?
            }
        };
        Ok(FetchPage {
            records,
            next_cursor: Some(cursor.encode()),
            complete: false,
            restarted: false,
        })
    }
}

fn file_to_record(file: File) -> Option<NormalizedRecord> {
    if file.trashed {
        return None;
    }
    let title = file
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "(untitled)".to_string());
    let owner = file
        .owners
        .first()
        .and_then(|o| o.display_name.clone().or_else(|| o.email_address.clone()));

    let occurred_at = file
        .modified_time
        .or(file.created_time)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    Some(
        NormalizedRecord::new(file.id, title, occurred_at)
            .with_excerpt(file.description.as_deref())
            .with_url(file.web_view_link)
            .with_metadata(json!({
                "mime_type": file.mime_type,
                "owner": owner,
            })),
    )
}

#[async_trait]
impl Connector for DriveConnector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn description(&self) -> &str {
        "Google Drive files (change-token incremental sync)"
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
        let Some(state) = DriveCursor::decode(cursor) else {
            warn!("undecodable drive cursor; restarting from scratch");
            return self
                .fetch_fresh(access_token, page_size)
                .await
                .map(FetchPage::into_restarted);
        };

        match self.fetch_resumed(access_token, state, page_size).await {
            Err(e) if http::is_status(&e, &[400, 404]) => {
                info!(error = %e, "page token rejected; restarting from scratch");
                self.fetch_fresh(access_token, page_size)
                    .await
                    .map(FetchPage::into_restarted)
            }
            other => other,
        }
    }
}
