//! Authenticated JSON transport shared by the Sheets and Drive clients.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{RequestBuilder, Url};
use serde_json::Value;

use crate::error::GoogleError;
use crate::google::auth::TokenProvider;

#[derive(Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    auth: Arc<TokenProvider>,
    timeout: Duration,
}

impl GoogleClient {
    pub fn new(http: reqwest::Client, auth: Arc<TokenProvider>, timeout: Duration) -> Self {
        Self {
            http,
            auth,
            timeout,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send `request` with a bearer token and decode the JSON body. An empty
    /// body decodes to `Value::Null`.
    pub async fn send_json(
        &self,
        api: &'static str,
        request: RequestBuilder,
    ) -> Result<Value, GoogleError> {
        let token = self.auth.access_token().await?;
        let resp = request
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GoogleError::Timeout(self.timeout)
                } else {
                    GoogleError::Request {
                        api,
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| GoogleError::Request {
            api,
            reason: e.to_string(),
        })?;

        if !status.is_success() {
            tracing::debug!(api, status = status.as_u16(), "Google API error: {body}");
            return Err(GoogleError::Status {
                api,
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| GoogleError::InvalidResponse {
            api,
            reason: e.to_string(),
        })
    }
}

/// `base` with `segments` appended, each percent-encoded.
pub fn endpoint(base: &str, segments: &[&str]) -> Result<Url, GoogleError> {
    let mut url = Url::parse(base).map_err(|e| GoogleError::Request {
        api: "url",
        reason: e.to_string(),
    })?;
    url.path_segments_mut()
        .map_err(|_| GoogleError::Request {
            api: "url",
            reason: format!("{base} cannot be a base URL"),
        })?
        .extend(segments);
    Ok(url)
}

/// Escape a value for a single-quoted Drive query literal.
pub fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
