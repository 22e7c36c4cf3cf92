//! Wiring of the bot's components from configuration.

use std::sync::Arc;

use tracing::info;

use crate::analyst::{AnalystQueryExecutor, ExecutorSettings};
use crate::config::BotConfig;
use crate::credential::{CredentialFiles, CredentialManager, CredentialSettings, RsaKeyGenerator};
use crate::error::BotError;
use crate::provision::ResourceProvisioner;
use crate::services::ChatOpsService;
use crate::session::{RouterSettings, SessionRouter};
use crate::slack::{ChatSink, SlackClient};
use crate::snowflake::{
    CortexAnalystBackend, SnowflakeClient, SnowflakeIdentityStore, SnowflakeProvisioningBackend,
};

/// Components shared by every command handler.
#[derive(Clone)]
pub struct BotState {
    inner: Arc<BotStateInner>,
}

struct BotStateInner {
    config: BotConfig,
    service: ChatOpsService,
    slack: Option<SlackClient>,
}

impl std::fmt::Debug for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotState")
            .field("config", &self.inner.config)
            .field("slack", &self.inner.slack.is_some())
            .finish_non_exhaustive()
    }
}

impl BotState {
    /// Build the Snowflake backends, credential manager, provisioner,
    /// executor and router described by `config`.
    ///
    /// Replies are posted to Slack when it is configured, otherwise through
    /// `fallback_sink` (if any).
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config(
        config: BotConfig,
        fallback_sink: Option<Arc<dyn ChatSink>>,
    ) -> Result<Self, BotError> {
        let tunables = config.tunables;
        let snowflake = SnowflakeClient::new(&config.snowflake, tunables.http_timeout)?;

        let identity = SnowflakeIdentityStore::new(
            snowflake.clone(),
            config.snowflake.bootstrap_token.clone(),
            tunables.query_poll_interval,
        );
        let files = CredentialFiles {
            private_key_path: config.credentials.private_key_path.clone(),
            artifact_path: config.credentials.artifact_path.clone(),
            account: config.snowflake.account.clone(),
            user: config.snowflake.user.clone(),
            host: config.snowflake.host.clone(),
        };
        let credentials = CredentialManager::new(
            config.snowflake.principal(),
            Arc::new(identity),
            Arc::new(RsaKeyGenerator::new(config.rsa_key_bits)),
            Some(files),
            CredentialSettings::from(&tunables),
        );

        let provisioner = ResourceProvisioner::new(
            Arc::new(SnowflakeProvisioningBackend::new(
                snowflake.clone(),
                tunables.query_poll_interval,
            )),
            config.snowflake.semantic_stage.clone(),
            config.snowflake.semantic_model_file.clone(),
            tunables.provision_step_timeout,
        );

        let executor = AnalystQueryExecutor::new(
            Arc::new(CortexAnalystBackend::new(snowflake)),
            ExecutorSettings {
                poll_interval: tunables.query_poll_interval,
                preview_row_cap: tunables.preview_row_cap,
            },
        );

        let router = SessionRouter::new(
            credentials,
            provisioner,
            executor,
            RouterSettings::new(config.snowflake.host.clone(), &tunables),
        );

        let slack = config
            .slack()
            .map(|slack| {
                SlackClient::new(
                    slack.bot_token.clone(),
                    slack.signing_secret.clone(),
                    tunables.http_timeout,
                )
            })
            .transpose()?;

        let sink = match &slack {
            Some(client) => Some(Arc::new(client.clone()) as Arc<dyn ChatSink>),
            None => fallback_sink,
        };

        info!(
            principal = %config.snowflake.principal(),
            host = %config.snowflake.host,
            slack = slack.is_some(),
            "Bot state initialized"
        );

        Ok(Self {
            inner: Arc::new(BotStateInner {
                config,
                service: ChatOpsService::new(router, sink),
                slack,
            }),
        })
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &BotConfig {
        &self.inner.config
    }

    /// Command handling service.
    #[must_use]
    pub fn service(&self) -> &ChatOpsService {
        &self.inner.service
    }

    /// Session router behind the service.
    #[must_use]
    pub fn router(&self) -> &SessionRouter {
        self.inner.service.router()
    }

    /// Slack client, when Slack is configured.
    #[must_use]
    pub fn slack(&self) -> Option<&SlackClient> {
        self.inner.slack.as_ref()
    }
}
