//! Error types for the audit pipeline
//!
//! [`ApiError`] classifies every failure coming back from the remote API so
//! the retry core and the expander can decide between retrying, absorbing
//! and recording. [`PipelineError`] is reserved for conditions that end a run.

use std::time::Duration;
use thiserror::Error;

/// A classified failure of one remote call
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// Server-side rate limiting (HTTP 429)
    #[error("throttled by remote API (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    /// Timeouts (including HTTP 408), connection faults and 5xx responses
    #[error("transient remote fault: {0}")]
    Transient(String),

    /// 404/400: the entity or relationship does not exist
    #[error("not found (HTTP {status})")]
    NotFound { status: u16 },

    /// Any other 4xx, permanent for this request
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The retry bound was reached
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ApiError> },
}

impl ApiError {
    /// Build an error from a non-success HTTP status
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: &str) -> Self {
        match status {
            429 => ApiError::Throttled { retry_after },
            400 | 404 => ApiError::NotFound { status },
            408 | 500..=599 => ApiError::Transient(format!("HTTP {}", status)),
            _ => ApiError::Rejected {
                status,
                message: message.to_string(),
            },
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, ApiError::Throttled { .. })
    }

    /// Throttling and transient faults are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Throttled { .. } | ApiError::Transient(_))
    }

    /// An expected negative result rather than a failure
    pub fn is_negative(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    /// Authentication was refused outright
    pub fn is_auth(&self) -> bool {
        match self {
            ApiError::Rejected { status, .. } => *status == 401,
            ApiError::Exhausted { last, .. } => last.is_auth(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if err.is_timeout() {
            ApiError::Transient("request timed out".to_string())
        } else {
            ApiError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Failures that terminate a run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot authenticate against the remote API: {0}")]
    Unauthenticated(ApiError),

    #[error("discovery returned no resources")]
    NoResources,

    #[error("every discovery strategy failed: {0}")]
    Discovery(ApiError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ApiError::from_status(429, None, "").is_throttle());
        assert!(ApiError::from_status(503, None, "").is_retryable());
        assert!(ApiError::from_status(408, None, "timeout").is_retryable());
        assert!(ApiError::from_status(404, None, "").is_negative());
        assert!(ApiError::from_status(400, None, "").is_negative());

        let forbidden = ApiError::from_status(403, None, "denied");
        assert!(!forbidden.is_retryable());
        assert!(!forbidden.is_negative());
    }

    #[test]
    fn test_auth_detection_through_exhausted() {
        let err = ApiError::Exhausted {
            attempts: 1,
            last: Box::new(ApiError::from_status(401, None, "expired")),
        };
        assert!(err.is_auth());
        assert!(!ApiError::Transient("x".into()).is_auth());
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::NotFound { status: 404 };
        assert_eq!(err.to_string(), "not found (HTTP 404)");
    }
}
