//! ChatOps service connecting the chat surface to the session router.
//!
//! For every command:
//! 1. Post an acknowledgement into the conversation
//! 2. Dispatch the command through the [`SessionRouter`], posting a line for
//!    every setup step as it finishes
//! 3. Render the reply and post each message in order
//!
//! Sessions idle past the configured timeout are evicted before each dispatch.

use std::sync::Arc;

use chrono::Utc;
use demo_mate_core::{Command, ConversationKey};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::error::BotError;
use crate::session::{Reply, SessionRouter};
use crate::slack::{ChatPayload, ChatSink, SlashCommand, render, render_ack, render_progress};

/// Outcome of handling one command.
#[derive(Debug)]
pub struct HandledCommand {
    /// What the router produced.
    pub reply: Reply,
    /// Messages posted after the acknowledgement, progress lines included.
    pub posted: usize,
    /// Messages that could not be posted.
    pub failed_posts: usize,
}

/// Runs commands and posts their replies.
#[derive(Clone)]
pub struct ChatOpsService {
    router: SessionRouter,
    sink: Option<Arc<dyn ChatSink>>,
}

impl std::fmt::Debug for ChatOpsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOpsService")
            .field("router", &self.router)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl ChatOpsService {
    /// Create a service posting through `sink`; `None` only logs replies.
    #[must_use]
    pub fn new(router: SessionRouter, sink: Option<Arc<dyn ChatSink>>) -> Self {
        Self { router, sink }
    }

    /// The router commands are dispatched through.
    #[must_use]
    pub const fn router(&self) -> &SessionRouter {
        &self.router
    }

    /// Run `command` and post its acknowledgement and reply.
    ///
    /// Posting failures are logged and counted, never returned.
    #[instrument(
        skip(self, command),
        fields(conversation = %command.conversation, command = command.kind.name())
    )]
    pub async fn handle(&self, command: &Command) -> HandledCommand {
        let evicted = self.router.evict_stale(Utc::now());
        if evicted > 0 {
            debug!(evicted, "Evicted idle sessions");
        }

        self.post(&command.conversation, &render_ack(command)).await;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let relay = async {
            let (mut posted, mut failed) = (0, 0);
            while let Some(step) = progress_rx.recv().await {
                if self.post(&command.conversation, &render_progress(&step)).await {
                    posted += 1;
                } else {
                    failed += 1;
                }
            }
            (posted, failed)
        };
        let (reply, (progress_posted, progress_failed)) = tokio::join!(
            self.router.dispatch_reporting(command, Some(progress_tx)),
            relay
        );

        let mut handled = self.deliver(&command.conversation, reply).await;
        handled.posted += progress_posted;
        handled.failed_posts += progress_failed;

        info!(
            failed = handled.reply.is_failure(),
            posted = handled.posted,
            failed_posts = handled.failed_posts,
            "Command handled"
        );
        handled
    }

    /// Render `reply` and post each message into `conversation` in order.
    pub async fn deliver(&self, conversation: &ConversationKey, reply: Reply) -> HandledCommand {
        let mut posted = 0;
        let mut failed_posts = 0;
        for payload in render(&reply) {
            if self.post(conversation, &payload).await {
                posted += 1;
            } else {
                failed_posts += 1;
            }
        }

        HandledCommand {
            reply,
            posted,
            failed_posts,
        }
    }

    /// Decode a slash command body and handle it.
    ///
    /// The transport verifies the request signature before calling this.
    /// Malformed commands are answered with a usage reply.
    ///
    /// # Errors
    ///
    /// Returns [`BotError::Slack`] if the body is not a slash command payload.
    #[instrument(skip(self, body))]
    pub async fn handle_slash(&self, body: &str) -> Result<HandledCommand, BotError> {
        let slash = SlashCommand::from_form(body)?;
        match slash.to_command() {
            Ok(command) => Ok(self.handle(&command).await),
            Err(e) => {
                let conversation = slash.conversation();
                let reply = Reply::Failed {
                    conversation: conversation.clone(),
                    operation: "command",
                    error: e.into(),
                };
                Ok(self.deliver(&conversation, reply).await)
            }
        }
    }

    async fn post(&self, conversation: &ConversationKey, payload: &ChatPayload) -> bool {
        let Some(sink) = &self.sink else {
            debug!(text = %payload.text, "No chat sink configured, reply not posted");
            return true;
        };
        match sink.post(conversation, payload).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to post reply");
                false
            }
        }
    }
}
