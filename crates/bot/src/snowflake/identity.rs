//! Public-key registration through the SQL API.

use std::time::Duration;

use async_trait::async_trait;
use demo_mate_core::Principal;
use secrecy::SecretString;
use tracing::instrument;

use super::client::{Auth, SnowflakeClient};
use super::quote_identifier;
use crate::backend::BackendError;
use crate::credential::IdentityStore;

/// Registers key-pair public keys on the bot's user.
///
/// Authenticates with the bootstrap programmatic access token, since no key
/// is registered yet when the first call is made.
pub struct SnowflakeIdentityStore {
    client: SnowflakeClient,
    bootstrap_token: SecretString,
    poll_interval: Duration,
}

impl std::fmt::Debug for SnowflakeIdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeIdentityStore")
            .field("client", &self.client)
            .field("bootstrap_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl SnowflakeIdentityStore {
    /// Create a store using `bootstrap_token` for its statements.
    #[must_use]
    pub const fn new(
        client: SnowflakeClient,
        bootstrap_token: SecretString,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            bootstrap_token,
            poll_interval,
        }
    }
}

/// `ALTER USER` statement registering `public_key`.
fn set_key_statement(principal: &Principal, public_key: &str) -> String {
    format!(
        "ALTER USER {} SET RSA_PUBLIC_KEY = '{public_key}'",
        quote_identifier(principal.user())
    )
}

/// `ALTER USER` statement removing the registered key.
fn unset_key_statement(principal: &Principal) -> String {
    format!(
        "ALTER USER {} UNSET RSA_PUBLIC_KEY",
        quote_identifier(principal.user())
    )
}

#[async_trait]
impl IdentityStore for SnowflakeIdentityStore {
    #[instrument(skip(self, public_key), fields(principal = %principal))]
    async fn set_public_key(
        &self,
        principal: &Principal,
        public_key: &str,
    ) -> Result<(), BackendError> {
        if !public_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        {
            return Err(BackendError::failed("public key is not base64"));
        }
        self.client
            .execute_to_completion(
                &set_key_statement(principal, public_key),
                Auth::Programmatic(&self.bootstrap_token),
                self.poll_interval,
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(principal = %principal))]
    async fn clear_public_key(&self, principal: &Principal) -> Result<(), BackendError> {
        self.client
            .execute_to_completion(
                &unset_key_statement(principal),
                Auth::Programmatic(&self.bootstrap_token),
                self.poll_interval,
            )
            .await?;
        Ok(())
    }
}
