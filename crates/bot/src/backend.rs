//! Transport-level errors shared by the warehouse backend seams.
//!
//! The identity store, provisioning backend and analyst backend all report
//! failures through [`BackendError`]; each component maps it into its own
//! error type at the boundary.

use thiserror::Error;

/// Errors returned by backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend rejected the bearer token or the principal lacks access.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend is temporarily unable to serve the request.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// The backend processed the request and reported a failure.
    #[error("{message}{}", format_request_id(.request_id.as_deref()))]
    Failed {
        /// Backend error message.
        message: String,
        /// Backend request ID, when one was returned.
        request_id: Option<String>,
    },

    /// The response could not be decoded.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Build a [`BackendError::Failed`] without a request ID.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            request_id: None,
        }
    }

    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Transient(_))
    }

    /// Whether the failure is an authentication or authorization rejection.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Backend request ID, when one was returned.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Failed { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

fn format_request_id(request_id: Option<&str>) -> String {
    request_id.map_or_else(String::new, |id| format!(" (request id: {id})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::Transient("503".to_string()).is_retryable());
        assert!(!BackendError::Unauthorized("bad jwt".to_string()).is_retryable());
        assert!(!BackendError::failed("syntax error").is_retryable());
    }

    #[test]
    fn test_failed_display_includes_request_id() {
        let err = BackendError::Failed {
            message: "SQL compilation error".to_string(),
            request_id: Some("01b2-abc".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "SQL compilation error (request id: 01b2-abc)"
        );
        assert_eq!(err.request_id(), Some("01b2-abc"));

        assert_eq!(BackendError::failed("boom").to_string(), "boom");
    }
}
