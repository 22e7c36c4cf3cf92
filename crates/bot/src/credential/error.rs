//! Credential-related errors.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors that can occur while generating, registering or using a keypair.
///
/// Messages never include key material.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    /// The identity store rejected or did not complete a public-key change.
    #[error("public key registration failed: {detail}")]
    RegistrationFailed {
        /// Whether a later attempt may succeed (network or availability issue).
        retryable: bool,
        /// Backend detail.
        detail: String,
    },

    /// Reading or writing the local credential files failed.
    #[error("credential storage error: {0}")]
    Storage(String),

    /// Token signing failed.
    #[error("token signing failed: {0}")]
    Signing(String),

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// What was being attempted.
        operation: &'static str,
        /// The budget that was exceeded.
        after: Duration,
    },
}

impl CredentialError {
    /// Map an identity-store failure into a registration error.
    #[must_use]
    pub fn registration(err: &BackendError) -> Self {
        Self::RegistrationFailed {
            retryable: err.is_retryable(),
            detail: err.to_string(),
        }
    }

    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RegistrationFailed { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for CredentialError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_retryability_follows_backend() {
        let transient = CredentialError::registration(&BackendError::Transient("503".to_string()));
        assert!(transient.is_retryable());

        let denied = CredentialError::registration(&BackendError::Unauthorized(
            "insufficient privileges".to_string(),
        ));
        assert!(!denied.is_retryable());
        assert_eq!(
            denied.to_string(),
            "public key registration failed: unauthorized: insufficient privileges"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = CredentialError::Timeout {
            operation: "token mint",
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "token mint timed out after 10s");
    }
}
