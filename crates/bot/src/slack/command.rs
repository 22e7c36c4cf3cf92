//! Slash command payloads.

use demo_mate_core::{Command, CommandError, CommandKind, ConversationKey};

use super::error::SlackError;

/// Form payload Slack sends for a slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    /// Command name, with the leading slash.
    pub command: String,
    /// Argument text.
    pub text: String,
    /// Channel the command was issued in.
    pub channel_id: String,
    /// Thread the command was issued in, when there is one.
    pub thread_ts: Option<String>,
    /// Invoking user.
    pub user_id: Option<String>,
    /// URL for delayed replies.
    pub response_url: Option<String>,
}

impl SlashCommand {
    /// Decode an `application/x-www-form-urlencoded` body.
    ///
    /// # Errors
    ///
    /// Returns [`SlackError::InvalidPayload`] if a required field is missing.
    pub fn from_form(body: &str) -> Result<Self, SlackError> {
        let mut command = None;
        let mut text = String::new();
        let mut channel_id = None;
        let mut thread_ts = None;
        let mut user_id = None;
        let mut response_url = None;

        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "command" => command = Some(value),
                "text" => text = value,
                "channel_id" => channel_id = Some(value),
                "thread_ts" if !value.is_empty() => thread_ts = Some(value),
                "user_id" => user_id = Some(value),
                "response_url" => response_url = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            command: command
                .ok_or_else(|| SlackError::InvalidPayload("missing command".to_string()))?,
            text,
            channel_id: channel_id
                .ok_or_else(|| SlackError::InvalidPayload("missing channel_id".to_string()))?,
            thread_ts,
            user_id,
            response_url,
        })
    }

    /// Conversation the command belongs to.
    #[must_use]
    pub fn conversation(&self) -> ConversationKey {
        match &self.thread_ts {
            Some(thread) => ConversationKey::thread(&self.channel_id, thread),
            None => ConversationKey::channel(&self.channel_id),
        }
    }

    /// Parse into a bot command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for unknown commands or malformed arguments.
    pub fn to_command(&self) -> Result<Command, CommandError> {
        let kind = CommandKind::parse(&self.command, &self.text)?;
        Ok(Command::new(self.conversation(), kind))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use demo_mate_core::ResourceSetId;

    use super::*;

    const FORM: &str = "token=x&team_id=T1&channel_id=C0123&user_id=U9\
        &command=%2Fcortalyst&text=tickets+per+day%3F\
        &response_url=https%3A%2F%2Fhooks.slack.com%2Fcommands%2F1";

    #[test]
    fn test_from_form() {
        let slash = SlashCommand::from_form(FORM).unwrap();
        assert_eq!(slash.command, "/cortalyst");
        assert_eq!(slash.text, "tickets per day?");
        assert_eq!(slash.channel_id, "C0123");
        assert_eq!(
            slash.response_url.as_deref(),
            Some("https://hooks.slack.com/commands/1")
        );
        assert_eq!(slash.conversation(), ConversationKey::channel("C0123"));
    }

    #[test]
    fn test_from_form_requires_channel() {
        let result = SlashCommand::from_form("command=%2Fsetup");
        assert!(matches!(result, Err(SlackError::InvalidPayload(_))));
    }

    #[test]
    fn test_to_command() {
        let slash = SlashCommand::from_form(FORM).unwrap();
        let command = slash.to_command().unwrap();
        assert_eq!(
            command.kind,
            CommandKind::Query {
                question: "tickets per day?".to_string()
            }
        );

        let setup = SlashCommand::from_form("command=%2Fsetup&channel_id=C1&thread_ts=1700.1")
            .unwrap()
            .to_command()
            .unwrap();
        assert_eq!(setup.conversation, ConversationKey::thread("C1", "1700.1"));
        assert_eq!(
            setup.kind,
            CommandKind::Setup {
                resource_set: ResourceSetId::default()
            }
        );
    }

    #[test]
    fn test_empty_question_is_rejected() {
        let slash = SlashCommand::from_form("command=%2Fcortalyst&channel_id=C1&text=+").unwrap();
        assert_eq!(slash.to_command(), Err(CommandError::EmptyQuestion));
    }
}
