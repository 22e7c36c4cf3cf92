//! Running chat commands from the terminal.
//!
//! # Usage
//!
//! ```bash
//! # Provision the default resource set for a channel
//! demo-mate setup --channel C0123456789
//!
//! # Ask a question in a thread
//! demo-mate ask --channel C0123456789 --thread 1700000000.000100 "ticket count by day"
//!
//! # Tear everything down
//! demo-mate cleanup --channel C0123456789
//! ```
//!
//! Replies go to Slack when `SLACK_BOT_TOKEN` and `SLACK_SIGNING_SECRET`
//! are set, otherwise they are printed.

use async_trait::async_trait;
use demo_mate_bot::services::ChatOpsService;
use demo_mate_bot::session::Reply;
use demo_mate_bot::slack::{Block, ChatPayload, ChatSink, ContextElement, SlackError};
use demo_mate_core::{Command, CommandKind, ConversationKey, ResourceSetId};
use tracing::{info, instrument};

use super::CliError;

/// Prints payloads to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl ChatSink for StdoutSink {
    #[allow(clippy::print_stdout)]
    async fn post(
        &self,
        conversation: &ConversationKey,
        payload: &ChatPayload,
    ) -> Result<(), SlackError> {
        println!("[{conversation}]");
        println!("{}", format_payload(payload));
        Ok(())
    }
}

/// Plain-text rendering of a payload's blocks.
fn format_payload(payload: &ChatPayload) -> String {
    if payload.blocks.is_empty() {
        return payload.text.clone();
    }

    payload
        .blocks
        .iter()
        .map(|block| match block {
            Block::Header { text } => format!("== {} ==", text.text),
            Block::Section { text } => text.as_str().to_string(),
            Block::Context { elements } => elements
                .iter()
                .map(|element| match element {
                    ContextElement::Mrkdwn { text } | ContextElement::PlainText { text, .. } => {
                        text.as_str()
                    }
                })
                .collect::<Vec<_>>()
                .join(" | "),
            Block::Divider => "----".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run one command and post its reply.
///
/// A query in a fresh process has no ready session yet, so the resource
/// set is verified first. Setup is idempotent and its reply is not posted.
///
/// # Errors
///
/// Returns [`CliError::CommandFailed`] if the reply reports a failure.
#[instrument(skip(service, command), fields(conversation = %command.conversation))]
pub async fn run(
    service: &ChatOpsService,
    command: &Command,
    resource_set: Option<ResourceSetId>,
) -> Result<(), CliError> {
    if matches!(command.kind, CommandKind::Query { .. }) {
        let setup = Command::new(
            command.conversation.clone(),
            CommandKind::Setup {
                resource_set: resource_set.unwrap_or_default(),
            },
        );
        let reply = service.router().dispatch(&setup).await;
        if reply.is_failure() {
            return finish(service.deliver(&setup.conversation, reply).await.reply);
        }
        info!("Resource set verified");
    }

    let handled = service.handle(command).await;
    finish(handled.reply)
}

fn finish(reply: Reply) -> Result<(), CliError> {
    match reply {
        Reply::Failed { operation, .. } => Err(CliError::CommandFailed { operation }),
        _ => Ok(()),
    }
}
