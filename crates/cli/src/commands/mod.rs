//! CLI subcommand implementations.

pub mod chat;
pub mod keygen;
pub mod status;

use thiserror::Error;

/// Errors that end a CLI run.
#[derive(Debug, Error)]
pub enum CliError {
    /// A bot component failed.
    #[error(transparent)]
    Bot(#[from] demo_mate_bot::error::BotError),

    /// Arguments did not form a valid command.
    #[error("Invalid arguments: {0}")]
    Command(#[from] demo_mate_core::CommandError),

    /// The command ran but its reply reports a failure.
    #[error("{operation} failed")]
    CommandFailed {
        /// Operation that failed.
        operation: &'static str,
    },

    /// Output could not be encoded.
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}
