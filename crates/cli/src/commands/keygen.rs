//! Key-pair management.
//!
//! # Usage
//!
//! ```bash
//! # Load the saved key, or generate and register one
//! demo-mate keygen
//!
//! # Replace the registered key with a new one
//! demo-mate keygen --rotate
//! ```

use demo_mate_bot::credential::CredentialManager;
use demo_mate_bot::error::BotError;
use serde_json::json;
use tracing::instrument;

use super::CliError;

/// Make sure a registered key exists and print its fingerprint.
///
/// # Errors
///
/// Returns an error if the key cannot be generated, saved or registered.
#[instrument(skip(credentials))]
#[allow(clippy::print_stdout)]
pub async fn run(credentials: &CredentialManager, rotate: bool) -> Result<(), CliError> {
    let mut fingerprint = credentials
        .load_or_ensure()
        .await
        .map_err(BotError::from)?;

    if rotate {
        credentials.invalidate().await;
        fingerprint = credentials
            .ensure_keypair()
            .await
            .map_err(BotError::from)?;
    }

    let output = json!({
        "principal": credentials.principal().to_string(),
        "fingerprint": fingerprint.to_string(),
        "rotated": rotate,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
