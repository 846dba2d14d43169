//! API Client
//!
//! Main client for the directory API, combining the bearer credential, the
//! HTTP layer, the retry policy and the run counters. Every request the
//! pipeline makes goes through here.

use super::batch::{self, BatchRequest, MAX_BATCH_SIZE};
use super::http::GraphHttpClient;
use super::retry::RetryPolicy;
use super::stats::RunStats;
use crate::error::ApiError;
use anyhow::{Context, Result};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Main directory API client
#[derive(Clone)]
pub struct ApiClient {
    http: GraphHttpClient,
    base_url: String,
    token: Arc<str>,
    retry: RetryPolicy,
    stats: Arc<RunStats>,
}

impl ApiClient {
    /// Create a new client. The bearer token is taken as given; acquiring
    /// it is the caller's business.
    pub fn new(
        base_url: &str,
        token: &str,
        retry: RetryPolicy,
        call_timeout: Duration,
        stats: Arc<RunStats>,
    ) -> Result<Self> {
        url::Url::parse(base_url).with_context(|| format!("Invalid API base URL: {}", base_url))?;

        Ok(Self {
            http: GraphHttpClient::new(call_timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Arc::from(token),
            retry,
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Absolute URL for a path; continuation links are already absolute
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Path relative to the API root, as batch sub-requests expect
    fn relative(&self, path: &str) -> String {
        let stripped = path.strip_prefix(&self.base_url).unwrap_or(path);
        if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{}", stripped)
        }
    }

    /// GET with the full retry policy
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        self.retry
            .run(&url, &self.stats, |_| {
                self.stats.record_call();
                self.http.get(&url, &self.token)
            })
            .await
    }

    /// GET for lookups where 404/400 is the normal answer. The negative
    /// result comes back as `Ok(None)` after a single attempt; throttling
    /// and transient faults are still retried.
    pub async fn get_optional(&self, path: &str) -> Result<Option<Value>, ApiError> {
        match self.get(path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_negative() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// GET many paths through `$batch`, returning one outcome per path in
    /// input order.
    pub async fn batch_get(&self, paths: &[String]) -> Vec<Result<Value, ApiError>> {
        let mut outcomes = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(MAX_BATCH_SIZE) {
            outcomes.extend(self.batch_chunk(chunk).await);
        }
        outcomes
    }

    async fn batch_chunk(&self, paths: &[String]) -> Vec<Result<Value, ApiError>> {
        let attempts = self.retry.max_attempts.max(1);
        let mut results: Vec<Option<Result<Value, ApiError>>> = (0..paths.len()).map(|_| None).collect();
        let mut pending: Vec<usize> = (0..paths.len()).collect();

        for attempt in 0..attempts {
            let requests: Vec<BatchRequest> = pending
                .iter()
                .map(|&i| BatchRequest::get((i + 1).to_string(), self.relative(&paths[i])))
                .collect();

            let responses = match self.post_batch(&requests).await {
                Ok(responses) => responses,
                Err(err) => {
                    tracing::warn!(
                        "Batch endpoint failed ({}), falling back to {} individual calls",
                        err,
                        pending.len()
                    );
                    self.stats.record_fallback();
                    let fallback = join_all(pending.iter().map(|&i| self.get(&paths[i]))).await;
                    for (&i, outcome) in pending.iter().zip(fallback) {
                        results[i] = Some(outcome);
                    }
                    pending.clear();
                    break;
                }
            };

            let mut retry_next = Vec::new();
            let mut delay = Duration::ZERO;

            for (&i, outcome) in pending.iter().zip(batch::match_responses(&requests, responses)) {
                match outcome {
                    Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                        delay = delay.max(self.retry.delay_for(attempt, &err));
                        if err.is_throttle() {
                            self.stats.record_throttle_retry();
                        } else {
                            self.stats.record_transient_retry();
                        }
                        retry_next.push(i);
                    }
                    Err(err) if err.is_retryable() => {
                        results[i] = Some(Err(ApiError::Exhausted {
                            attempts,
                            last: Box::new(err),
                        }));
                    }
                    other => results[i] = Some(other),
                }
            }

            pending = retry_next;
            if pending.is_empty() {
                break;
            }

            tracing::debug!(
                "Retrying {} batch sub-requests in {:?}",
                pending.len(),
                delay
            );
            tokio::time::sleep(delay).await;
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(ApiError::Transient("batch sub-request not attempted".into()))))
            .collect()
    }

    /// POST one `$batch` envelope under the retry policy and decode it
    async fn post_batch(
        &self,
        requests: &[BatchRequest],
    ) -> Result<Vec<batch::BatchResponse>, ApiError> {
        let url = self.url("/$batch");
        let body = batch::build_body(requests);

        let response = self
            .retry
            .run(&url, &self.stats, |_| {
                self.stats.record_call();
                self.http.post(&url, &self.token, &body)
            })
            .await?;

        self.stats.record_batch(requests.len());
        batch::decode_envelope(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ApiClient {
        ApiClient::new(
            "https://graph.example.com/v1.0/",
            "token",
            RetryPolicy::default(),
            Duration::from_secs(5),
            Arc::new(RunStats::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_url_building() {
        let c = client();
        assert_eq!(c.url("/sites/root"), "https://graph.example.com/v1.0/sites/root");
        assert_eq!(c.url("sites/root"), "https://graph.example.com/v1.0/sites/root");
        assert_eq!(
            c.url("https://other.example.com/next?page=2"),
            "https://other.example.com/next?page=2"
        );
    }

    #[test]
    fn test_relative_strips_base() {
        let c = client();
        assert_eq!(
            c.relative("https://graph.example.com/v1.0/sites/a/drive"),
            "/sites/a/drive"
        );
        assert_eq!(c.relative("sites/a"), "/sites/a");
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let result = ApiClient::new(
            "not a url",
            "t",
            RetryPolicy::default(),
            Duration::from_secs(1),
            Arc::new(RunStats::new()),
        );
        assert!(result.is_err());
    }
}
