//! OAuth refresh-token grant over HTTP.
//!
//! [`HttpTokenExchanger`] implements the core [`TokenExchanger`] by POSTing
//! a `grant_type=refresh_token` form to the provider's token endpoint,
//! using the client registration from `[oauth.<provider>]` in the config.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use tributary_core::models::OAuthProvider;
use tributary_core::token::{RefreshedToken, TokenExchanger};

use crate::config::{OAuthClientConfig, OAuthConfigs};

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const SLACK_TOKEN_URL: &str = "https://slack.com/api/oauth.v2.access";

fn default_token_url(provider: OAuthProvider) -> &'static str {
    match provider {
        OAuthProvider::Google => GOOGLE_TOKEN_URL,
        OAuthProvider::Slack => SLACK_TOKEN_URL,
    }
}

/// Token endpoint response. Google and Slack both use these field names;
/// Slack reports failures as `{"ok": false, "error": "..."}` with HTTP 200.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

pub struct HttpTokenExchanger {
    client: Client,
    clients: OAuthConfigs,
}

impl HttpTokenExchanger {
    pub fn new(clients: OAuthConfigs) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, clients })
    }

    fn client_config(&self, provider: OAuthProvider) -> Result<&OAuthClientConfig> {
        self.clients
            .get(provider)
            .ok_or_else(|| anyhow!("no [oauth.{}] client configured", provider))
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    #[tracing::instrument(level = "debug", skip(self, refresh_token))]
    async fn refresh(&self, provider: OAuthProvider, refresh_token: &str) -> Result<RefreshedToken> {
        let cfg = self.client_config(provider)?;
        let url = cfg
            .token_url
            .as_deref()
            .unwrap_or_else(|| default_token_url(provider));

        let params = [
            ("client_id", cfg.client_id.as_str()),
            ("client_secret", cfg.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .client
            .post(url)
            .form(&params)
            .send()
            .await
            .with_context(|| format!("token request to {} failed", url))?;
        let status = resp.status();
        let body: TokenResponse = resp
            .json()
            .await
            .with_context(|| format!("token endpoint returned HTTP {} with an unreadable body", status))?;

        if let Some(error) = body.error {
            match body.error_description {
                Some(desc) => bail!("OAuth refresh error: {} ({})", error, desc),
                None => bail!("OAuth refresh error: {}", error),
            }
        }
        if !status.is_success() {
            bail!("token endpoint returned HTTP {}", status);
        }
        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("token response has no access_token"))?;

        debug!(expires_in = ?body.expires_in, rotated = body.refresh_token.is_some(), "token exchanged");
        Ok(RefreshedToken {
            access_token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchanger(token_url: String) -> HttpTokenExchanger {
        HttpTokenExchanger::new(OAuthConfigs {
            google: Some(OAuthClientConfig {
                client_id: "cid".into(),
                client_secret: "secret".into(),
                token_url: Some(token_url),
            }),
            slack: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-token","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let token = exchanger(format!("{}/token", server.url()))
            .refresh(OAuthProvider::Google, "r1")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(token.access_token, "new-token");
        assert!(token.refresh_token.is_none());
        assert!(token.expires_at.unwrap() > Utc::now() + chrono::Duration::minutes(50));
    }

    #[tokio::test]
    async fn test_refresh_error_field_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been revoked."}"#)
            .create_async()
            .await;

        let err = exchanger(format!("{}/token", server.url()))
            .refresh(OAuthProvider::Google, "r1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails() {
        let err = exchanger("http://127.0.0.1:1/token".into())
            .refresh(OAuthProvider::Slack, "r1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oauth.slack"));
    }
}
