//! Unified error handling for the bot.

use demo_mate_core::CommandError;
use thiserror::Error;

use crate::analyst::QueryError;
use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::provision::ProvisionError;
use crate::session::SessionError;
use crate::slack::SlackError;

/// Any failure a command can end in.
#[derive(Debug, Error)]
pub enum BotError {
    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Keypair or token handling failed.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Creating or destroying the resource set failed.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// The question could not be answered.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// The conversation is not in a state that accepts the command.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// The command text could not be parsed.
    #[error("{0}")]
    Command(#[from] CommandError),

    /// A backend call failed outside any component.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Posting to Slack failed.
    #[error("Slack error: {0}")]
    Slack(#[from] SlackError),
}

impl BotError {
    /// Whether the error was caused by the request rather than a fault.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Session(_)
                | Self::Command(_)
                | Self::Provision(
                    ProvisionError::Conflict { .. } | ProvisionError::InvalidResourceSet(_)
                )
                | Self::Query(QueryError::Cancelled)
        )
    }

    /// Log the error, sending faults to Sentry.
    pub fn report(&self, operation: &str) {
        if self.is_user_error() {
            tracing::info!(error = %self, operation, "Command rejected");
            return;
        }

        let event_id = sentry::capture_error(self);
        tracing::error!(
            error = %self,
            operation,
            sentry_event_id = %event_id,
            "Command failed"
        );
    }
}
