//! Query errors.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors returned while running an analyst query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The backend rejected the bearer token.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The backend failed the query.
    #[error("{detail}{}", .request_id.as_ref().map_or_else(String::new, |id| format!(" (request id: {id})")))]
    BackendFailed {
        /// Backend detail.
        detail: String,
        /// Backend request ID, when one was returned.
        request_id: Option<String>,
    },

    /// No terminal result arrived in time. The backend query may still run.
    #[error("no answer after {}s", .after.as_secs())]
    Timeout {
        /// The budget that was exceeded.
        after: Duration,
    },

    /// The query was cancelled before it finished.
    #[error("query cancelled")]
    Cancelled,
}

impl QueryError {
    /// Whether the failure is a rejected token.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }
}

impl From<BackendError> for QueryError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unauthorized(detail) => Self::AuthFailed(detail),
            BackendError::Failed {
                message,
                request_id,
            } => Self::BackendFailed {
                detail: message,
                request_id,
            },
            other => Self::BackendFailed {
                detail: other.to_string(),
                request_id: None,
            },
        }
    }
}
