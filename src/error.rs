//! Error types shared across the reader service.
//!
//! Every failure that escapes a request handler is one of these kinds; the
//! HTTP layer maps them to a status code and the `{code, message}` wire
//! envelope, or to a terminal `error` frame on streaming responses.

use serde::Serialize;

/// Error kinds surfaced by the reader service
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Bad URL, overlong prompt, out-of-range turn count
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing or unusable credentials
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Account balance too low for the requested operation
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Caller exceeded its request quota
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Navigation timeout, crashed context, browser relaunch failure
    #[error("Browser failure: {0}")]
    UpstreamBrowserFailure(String),

    /// Model stream aborted or rejected the request
    #[error("Model failure: {0}")]
    UpstreamModelFailure(String),

    /// Object-storage or record-store operation failed
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Anything without a more specific kind
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReaderError {
    /// Stable wire code for the envelope, independent of Display text
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Unauthenticated(_) => "Unauthenticated",
            Self::InsufficientBalance(_) => "InsufficientBalance",
            Self::RateLimited(_) => "RateLimited",
            Self::UpstreamBrowserFailure(_) => "UpstreamBrowserFailure",
            Self::UpstreamModelFailure(_) => "UpstreamModelFailure",
            Self::StorageFailure(_) => "StorageFailure",
            Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status for non-streaming responses
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::InsufficientBalance(_) => 402,
            Self::RateLimited(_) => 429,
            Self::UpstreamBrowserFailure(_) | Self::UpstreamModelFailure(_) => 502,
            Self::StorageFailure(_) | Self::Internal(_) => 500,
        }
    }

    /// Wire envelope for non-streaming error responses
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<anyhow::Error> for ReaderError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} preserves the full context chain
        Self::Internal(format!("{err:#}"))
    }
}

/// `{code, message}` body returned on non-streaming failures
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, ReaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_code() {
        let err = ReaderError::InvalidArgument("url scheme must be http or https".into());
        let env = err.envelope();
        assert_eq!(env.code, "InvalidArgument");
        assert!(env.message.contains("url scheme"));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn upstream_failures_map_to_bad_gateway() {
        assert_eq!(
            ReaderError::UpstreamBrowserFailure("nav timeout".into()).http_status(),
            502
        );
        assert_eq!(
            ReaderError::UpstreamModelFailure("stream aborted".into()).http_status(),
            502
        );
    }
}
