//! JSON batching wire format
//!
//! A batch carries at most [`MAX_BATCH_SIZE`] sub-requests, each tagged with a
//! batch-local id. The provider may reorder or omit sub-responses, so
//! responses are always matched back to requests by id.

use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on sub-requests per `$batch` call
pub const MAX_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRequest {
    pub id: String,
    pub method: String,
    pub url: String,
}

impl BatchRequest {
    pub fn get(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl BatchResponse {
    fn retry_after(&self) -> Option<Duration> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, v)| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Classify the sub-response the same way a standalone call would be
    pub fn into_result(self) -> Result<Value, ApiError> {
        if (200..300).contains(&self.status) {
            return Ok(self.body);
        }
        let retry_after = self.retry_after();
        let message = self
            .body
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Err(ApiError::from_status(self.status, retry_after, &message))
    }
}

#[derive(Debug, Deserialize)]
struct BatchEnvelope {
    responses: Vec<BatchResponse>,
}

/// Serialize sub-requests into a `$batch` body
pub fn build_body(requests: &[BatchRequest]) -> Value {
    json!({ "requests": requests })
}

/// Decode a `$batch` response body. A body without a `responses` array is a
/// structural failure of the batch endpoint.
pub fn decode_envelope(body: Value) -> Result<Vec<BatchResponse>, ApiError> {
    let envelope: BatchEnvelope = serde_json::from_value(body)?;
    Ok(envelope.responses)
}

/// Pair each request with its response by id, in request order.
/// Requests the provider omitted come back as transient faults.
pub fn match_responses(
    requests: &[BatchRequest],
    responses: Vec<BatchResponse>,
) -> Vec<Result<Value, ApiError>> {
    let mut by_id: HashMap<String, BatchResponse> = responses
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    requests
        .iter()
        .map(|req| match by_id.remove(&req.id) {
            Some(resp) => resp.into_result(),
            None => Err(ApiError::Transient(format!(
                "sub-request {} missing from batch response",
                req.id
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: &str, status: u16, body: Value) -> BatchResponse {
        BatchResponse {
            id: id.to_string(),
            status,
            headers: HashMap::new(),
            body,
        }
    }

    #[test]
    fn test_build_body_shape() {
        let body = build_body(&[BatchRequest::get("1", "/sites/a/drive")]);
        assert_eq!(body["requests"][0]["id"], "1");
        assert_eq!(body["requests"][0]["method"], "GET");
        assert_eq!(body["requests"][0]["url"], "/sites/a/drive");
    }

    #[test]
    fn test_match_by_id_not_position() {
        let requests = vec![
            BatchRequest::get("1", "/a"),
            BatchRequest::get("2", "/b"),
        ];
        let responses = vec![
            response("2", 200, json!({"name": "b"})),
            response("1", 200, json!({"name": "a"})),
        ];

        let matched = match_responses(&requests, responses);
        assert_eq!(matched[0].as_ref().unwrap()["name"], "a");
        assert_eq!(matched[1].as_ref().unwrap()["name"], "b");
    }

    #[test]
    fn test_missing_response_is_transient() {
        let requests = vec![BatchRequest::get("1", "/a"), BatchRequest::get("2", "/b")];
        let matched = match_responses(&requests, vec![response("1", 200, json!({}))]);
        assert!(matched[0].is_ok());
        assert!(matches!(matched[1], Err(ApiError::Transient(_))));
    }

    #[test]
    fn test_sub_response_throttle_carries_hint() {
        let mut resp = response("1", 429, Value::Null);
        resp.headers.insert("Retry-After".into(), "4".into());
        match resp.into_result() {
            Err(ApiError::Throttled { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(4)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_envelope_without_responses_is_structural_failure() {
        assert!(decode_envelope(json!({"error": "nope"})).is_err());
        let ok = decode_envelope(json!({"responses": [{"id": "1", "status": 404}]})).unwrap();
        assert_eq!(ok.len(), 1);
        assert!(ok[0].body.is_null());
    }
}
