//! Error types for the fetch layer.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::http::Method;

/// Why a single HTTP attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The provider answered with a non-success status.
    Status(u16),
    /// The attempt did not finish within the configured timeout.
    Timeout,
    /// Connection-level failure (DNS, reset, TLS, ...).
    Network(String),
    /// The response body could not be decoded.
    Decode(String),
    /// The attempt was abandoned before producing a response.
    Aborted(String),
}

impl FailureCause {
    /// The HTTP status, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Network(message) => write!(f, "network error: {message}"),
            Self::Decode(message) => write!(f, "decode error: {message}"),
            Self::Aborted(message) => write!(f, "aborted: {message}"),
        }
    }
}

/// Errors surfaced by the rate limiter, transport, client, and ingestor.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The limiter rejected the call or the provider signalled a rate limit.
    #[error("rate limit exceeded for {key}; retry after {retry_after:?}")]
    RateLimitExceeded { key: String, retry_after: Duration },

    /// Every retry attempt failed.
    #[error("{method} {path} failed after {attempts} attempts (last: {last_cause})")]
    RetryExhausted {
        method: Method,
        path: String,
        attempts: u32,
        last_cause: FailureCause,
    },

    /// A single attempt failed with a non-retryable or terminal error.
    #[error("{method} {path} failed: {cause}")]
    TransportFailed {
        method: Method,
        path: String,
        cause: FailureCause,
    },

    /// The call succeeded but carried no usable payload.
    #[error("{method} {path} returned no usable result")]
    MissingResult { method: Method, path: String },

    /// The request could not be built (bad base URL, bad header, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// An error propagated from the run ledger.
    #[error("ledger error: {0}")]
    Ledger(#[from] marquee_core::Error),
}

/// Coarse classification callers branch on instead of matching variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Backpressure: wait at least this long and try again later.
    RateLimited(Duration),
    /// Transient transport trouble; the job may retry the record later.
    Retryable,
    /// The request or the provider response is broken.
    Terminal,
    /// The provider had nothing relevant.
    NoData,
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => ErrorClass::RateLimited(*retry_after),
            Self::RetryExhausted { .. } => ErrorClass::Retryable,
            Self::TransportFailed { cause, .. } => match cause {
                FailureCause::Timeout | FailureCause::Network(_) => ErrorClass::Retryable,
                FailureCause::Status(status) if *status >= 500 => ErrorClass::Retryable,
                _ => ErrorClass::Terminal,
            },
            Self::MissingResult { .. } => ErrorClass::NoData,
            Self::InvalidRequest(_) | Self::Client(_) | Self::Ledger(_) => ErrorClass::Terminal,
        }
    }

    /// Returns `true` when the operation may succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::RateLimited(_) | ErrorClass::Retryable
        )
    }

    /// Returns `true` when the provider responded but had nothing relevant.
    pub fn is_missing_result(&self) -> bool {
        matches!(self, Self::MissingResult { .. })
    }
}

/// Convenience alias for fetch results.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(cause: FailureCause) -> FetchError {
        FetchError::TransportFailed {
            method: Method::Get,
            path: "/movie/1".to_string(),
            cause,
        }
    }

    #[test]
    fn test_rate_limit_class_carries_wait() {
        let err = FetchError::RateLimitExceeded {
            key: "tmdb".to_string(),
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited(Duration::from_secs(12)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_transport_failures_split_by_cause() {
        assert_eq!(failed(FailureCause::Timeout).class(), ErrorClass::Retryable);
        assert_eq!(failed(FailureCause::Status(503)).class(), ErrorClass::Retryable);
        assert_eq!(failed(FailureCause::Status(404)).class(), ErrorClass::Terminal);
        assert_eq!(
            failed(FailureCause::Decode("eof".to_string())).class(),
            ErrorClass::Terminal
        );
    }

    #[test]
    fn test_missing_result_is_no_data() {
        let err = FetchError::MissingResult {
            method: Method::Get,
            path: "/movie/1/translations".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::NoData);
        assert!(err.is_missing_result());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_retry_exhausted_display() {
        let err = FetchError::RetryExhausted {
            method: Method::Get,
            path: "/movie/1".to_string(),
            attempts: 3,
            last_cause: FailureCause::Status(502),
        };
        assert_eq!(
            err.to_string(),
            "GET /movie/1 failed after 3 attempts (last: HTTP 502)"
        );
    }
}
