//! Resource set and session inspection.
//!
//! # Usage
//!
//! ```bash
//! demo-mate status
//! demo-mate status --database sales --schema raw
//! ```

use demo_mate_bot::error::BotError;
use demo_mate_bot::session::SessionRouter;
use demo_mate_core::ResourceSetId;
use serde_json::json;
use tracing::instrument;

use super::CliError;

/// Probe `resource_set` and print its status with the local sessions.
///
/// # Errors
///
/// Returns an error if no token can be minted or a probe fails.
#[instrument(skip(router), fields(resource_set = %resource_set))]
#[allow(clippy::print_stdout)]
pub async fn run(router: &SessionRouter, resource_set: &ResourceSetId) -> Result<(), CliError> {
    let credentials = router.credentials();
    let fingerprint = credentials
        .load_or_ensure()
        .await
        .map_err(BotError::from)?;
    let token = credentials
        .mint_token(router.audience())
        .await
        .map_err(BotError::from)?;

    let status = router
        .provisioner()
        .status(resource_set, &token)
        .await
        .map_err(BotError::from)?;

    let output = json!({
        "resource_set": resource_set.to_string(),
        "status": status,
        "semantic_model": router.provisioner().semantic_model(resource_set).to_string(),
        "principal": credentials.principal().to_string(),
        "fingerprint": fingerprint.to_string(),
        "sessions": router.snapshots(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
