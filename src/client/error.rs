//! API client error types.
//!
//! [`ApiError::RemoteUnavailable`] is what callers see once the retry budget is
//! spent; the [`TransientError`] it carries is the cause of the final attempt.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Token acquisition failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token endpoint could not be reached.
    #[error("token request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// Token endpoint rejected the credentials.
    #[error("token endpoint returned {status}: {body}")]
    Rejected {
        /// HTTP status returned by the token endpoint.
        status: StatusCode,
        /// Response body, usually an OAuth error document.
        body: String,
    },

    /// Token response could not be decoded.
    #[error("invalid token response: {0}")]
    Decode(#[source] reqwest::Error),

    /// Authority or tenant produced an invalid URL.
    #[error("invalid token endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl AuthError {
    /// Whether a later token request may succeed: connection failures,
    /// timeouts, 5xx and 429 from the token endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode(_) | Self::InvalidUrl(_) => false,
        }
    }
}

/// Failure of a single attempt that is worth retrying.
#[derive(Debug, Error)]
pub enum TransientError {
    /// Connection or protocol level failure.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// Attempt exceeded the request timeout.
    #[error("request timed out")]
    Timeout,

    /// Server error or rate limit response.
    #[error("server returned {status}")]
    Status {
        /// 5xx or 429.
        status: StatusCode,
        /// Parsed `Retry-After` header, if present.
        retry_after: Option<Duration>,
    },

    /// Token refresh failed in a way worth retrying.
    #[error("token refresh failed: {0}")]
    Token(#[source] AuthError),
}

impl TransientError {
    /// Server supplied delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn from_auth(err: AuthError) -> Self {
        match err {
            AuthError::Transport(e) if e.is_timeout() => Self::Timeout,
            other => Self::Token(other),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err)
        }
    }
}

/// Errors returned by the API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Every attempt failed transiently.
    #[error("remote unavailable after {attempts} attempt(s): {source}")]
    RemoteUnavailable {
        /// Attempts made, including the first.
        attempts: u32,
        /// Cause of the last attempt.
        #[source]
        source: TransientError,
    },

    /// Non-retryable HTTP status.
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        /// Returned status code.
        status: StatusCode,
        /// Request URL.
        url: String,
        /// Response body (truncated).
        body: String,
    },

    /// Response body did not match the expected shape.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        /// Request URL.
        url: String,
        /// JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Could not obtain an access token.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Request path or base URL is invalid.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP client could not be constructed or a request could not be built.
    #[error("http client error: {0}")]
    Build(#[source] reqwest::Error),

    /// Concurrency budget was closed.
    #[error("api client is shut down")]
    Closed,
}

impl ApiError {
    /// Whether the error came from exhausting retries.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable { .. })
    }

    /// HTTP status of a non-retryable response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_unavailable_display_includes_cause() {
        let err = ApiError::RemoteUnavailable {
            attempts: 4,
            source: TransientError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                retry_after: None,
            },
        };
        let message = err.to_string();
        assert!(message.contains("4 attempt(s)"));
        assert!(message.contains("503"));
        assert!(err.is_remote_unavailable());
    }

    #[test]
    fn test_retry_after_only_on_status() {
        let hinted = TransientError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(hinted.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(TransientError::Timeout.retry_after(), None);
    }

    #[test]
    fn test_token_endpoint_failures_classified() {
        let rejected = |code: u16| AuthError::Rejected {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert!(rejected(503).is_transient());
        assert!(rejected(500).is_transient());
        assert!(rejected(429).is_transient());
        assert!(!rejected(400).is_transient());
        assert!(!rejected(401).is_transient());
        assert!(!AuthError::InvalidUrl(url::ParseError::EmptyHost).is_transient());
    }
}
