//! Error types for leadenrich.
//!
//! Library crates use [`EnrichError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all enrichment operations.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// Malformed input record. Never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Timeout, 5xx, or an ambiguous/malformed payload. Retryable.
    #[error("transient error: {message}")]
    Transient {
        message: String,
        status: Option<u16>,
    },

    /// HTTP 429. Never retried automatically; carries the provider's hint as sent.
    #[error("rate limited by {provider} (retry-after: {})", retry_after.as_deref().unwrap_or("none"))]
    RateLimited {
        provider: String,
        retry_after: Option<String>,
    },

    /// A raw 401 observed on a call, before the reauth decision is made.
    #[error("unauthorized response from {provider}")]
    Unauthorized { provider: String },

    /// Explicit auth failure, or a 401 that survived one reauthentication.
    #[error("authentication error: {message}")]
    Authentication { message: String },

    /// The provider explicitly reported no match.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Non-retryable 4xx carrying a provider error payload.
    #[error("rejected by provider (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Transport failure other than a timeout (connection refused, DNS, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database, blob surface, or lock error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The surrounding batch was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EnrichError>;

impl EnrichError {
    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a transient error with no HTTP status attached.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            status: None,
        }
    }

    /// Create an authentication error from any displayable message.
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication {
            message: msg.into(),
        }
    }

    /// Create a not-found error from any displayable message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the Retrier may re-issue the call that produced this error.
    ///
    /// Only transient failures (5xx, timeouts, malformed payloads) qualify.
    /// 429 and 401 are handed back to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Stable label used in diagnostic trails and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Transient { .. } => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Authentication { .. } => "authentication",
            Self::NotFound { .. } => "not_found",
            Self::Rejected { .. } => "rejected",
            Self::Network(_) => "network",
            Self::Config { .. } => "config",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Cancelled => "cancelled",
        }
    }

    /// The provider's retry-after hint, if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::RateLimited { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = EnrichError::config("missing token url");
        assert_eq!(err.to_string(), "config error: missing token url");

        let err = EnrichError::RateLimited {
            provider: "skip-trace".into(),
            retry_after: Some("17".into()),
        };
        assert!(err.to_string().contains("retry-after: 17"));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(EnrichError::transient("503").is_retryable());
        assert!(
            !EnrichError::RateLimited {
                provider: "p".into(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(!EnrichError::Unauthorized { provider: "p".into() }.is_retryable());
        assert!(!EnrichError::Network("refused".into()).is_retryable());
        assert!(!EnrichError::not_found("no match").is_retryable());
    }

    #[test]
    fn retry_after_is_passed_through_verbatim() {
        let err = EnrichError::RateLimited {
            provider: "p".into(),
            retry_after: Some("Wed, 21 Oct 2026 07:28:00 GMT".into()),
        };
        assert_eq!(err.retry_after(), Some("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(err.kind(), "rate_limited");
    }
}
