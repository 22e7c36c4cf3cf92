//! Slack surface of the bot.
//!
//! This module provides:
//! - [`SlashCommand`] for decoding slash command payloads into commands
//! - [`SlackClient`] for posting replies and verifying request signatures
//! - [`ChatSink`], the seam replies are posted through
//! - Block Kit types and the reply renderer in [`messages`]

mod client;
mod command;
mod error;
pub mod messages;
mod types;

pub use client::{ChatSink, SlackClient};
pub use command::SlashCommand;
pub use error::SlackError;
pub use messages::{render, render_ack, render_progress};
pub use types::{
    Block, ChatPayload, ContextElement, PlainText, PostMessageResponse, ResponseType, Text,
};
