//! HTTP utilities for the directory REST API

use crate::error::ApiError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
pub fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Parse a `Retry-After` header given in whole seconds
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Thin wrapper around `reqwest` that turns every response into a
/// classified [`ApiError`] or a JSON value. One call, no retries.
#[derive(Clone)]
pub struct GraphHttpClient {
    client: Client,
    timeout: Duration,
}

impl GraphHttpClient {
    /// Create a new HTTP client; `timeout` bounds each individual call
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("siteaudit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client, timeout })
    }

    /// GET a URL and decode the JSON body
    pub async fn get(&self, url: &str, token: &str) -> Result<Value, ApiError> {
        tracing::debug!("GET {}", url);
        let request = self.client.get(url).bearer_auth(token);
        self.send(request).await
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post(&self, url: &str, token: &str, body: &Value) -> Result<Value, ApiError> {
        tracing::debug!("POST {}", url);
        let request = self.client.post(url).bearer_auth(token).json(body);
        self.send(request).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ApiError> {
        let response = request.timeout(self.timeout).send().await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;

        if !status.is_success() {
            let sanitized = sanitize_for_log(&body);
            // 404/400 are routinely expected by probes; keep them quiet
            if matches!(status.as_u16(), 400 | 404) {
                tracing::debug!("API returned {} - {}", status, sanitized);
            } else {
                tracing::warn!("API error: {} - {}", status, sanitized);
            }
            return Err(ApiError::from_status(status.as_u16(), retry_after, &sanitized));
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        Ok(serde_json::from_str(&body)?)
    }
}
