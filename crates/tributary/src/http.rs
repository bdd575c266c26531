//! Shared HTTP plumbing for the provider connectors.
//!
//! Wraps a [`reqwest::Client`] with a base URL, bearer auth and the status
//! mapping every connector relies on:
//!
//! | Status | Error |
//! |--------|-------|
//! | 401, 403 | [`ConnectorError::Unauthorized`] |
//! | 429 | [`ConnectorError::RateLimited`] (honours `Retry-After`) |
//! | other non-2xx | [`ConnectorError::Http`] |

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use tributary_core::ConnectorError;

use crate::config::HttpSettings;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_ERROR_BODY_CHARS: usize = 300;

/// HTTP client bound to one provider API root.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(settings: &HttpSettings, default_base_url: &str) -> Result<Self> {
        let timeout = Duration::from_secs(settings.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tributary/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = settings
            .base_url
            .as_deref()
            .unwrap_or(default_base_url)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET `path` with `query` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ConnectorError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = check_status(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ConnectorError::Decode(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> ConnectorError {
        if e.is_timeout() {
            ConnectorError::Timeout(self.timeout)
        } else {
            ConnectorError::Transport(e.to_string())
        }
    }
}

/// Map a non-success response to the matching [`ConnectorError`].
pub async fn check_status(resp: Response) -> Result<Response, ConnectorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ConnectorError::RateLimited {
            retry_after: retry_after(&resp),
        });
    }

    let body = resp.text().await.unwrap_or_default();
    let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ConnectorError::Unauthorized(format!("HTTP {}: {}", status.as_u16(), message)))
        }
        _ => Err(ConnectorError::Http {
            status: status.as_u16(),
            message,
        }),
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Whether `err` is an HTTP error with one of `statuses`.
pub fn is_status(err: &ConnectorError, statuses: &[u16]) -> bool {
    matches!(err, ConnectorError::Http { status, .. } if statuses.contains(status))
}

/// Clamp a caller page size hint to the provider's allowed range.
pub fn page_size(hint: Option<usize>, default: usize, max: usize) -> String {
    hint.unwrap_or(default).clamp(1, max).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn client(server: &mockito::Server) -> ApiClient {
        ApiClient::new(
            &HttpSettings {
                base_url: Some(format!("{}/", server.url())),
                timeout_secs: Some(5),
            },
            "https://unused.example.com",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/unauthorized")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/limited")
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;
        server
            .mock("GET", "/gone")
            .with_status(410)
            .with_body("sync token expired")
            .create_async()
            .await;

        let api = client(&server);
        let err = api.get_json::<Value>("t", "/unauthorized", &[]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unauthorized(_)));

        let err = api.get_json::<Value>("t", "limited", &[]).await.unwrap_err();
        match err {
            ConnectorError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = api.get_json::<Value>("t", "gone", &[]).await.unwrap_err();
        assert!(is_status(&err, &[410]));
        assert!(err.to_string().contains("sync token expired"));
    }

    #[tokio::test]
    async fn test_bearer_token_and_query_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/items")
            .match_header("authorization", "Bearer secret")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "10".into()))
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let body: Value = client(&server)
            .get_json("secret", "items", &[("limit", "10".to_string())])
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(body["ok"], true);
    }

    #[test]
    fn test_page_size_clamps() {
        assert_eq!(page_size(None, 100, 500), "100");
        assert_eq!(page_size(Some(10_000), 100, 500), "500");
        assert_eq!(page_size(Some(0), 100, 500), "1");
    }
}
