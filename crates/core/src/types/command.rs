//! Commands accepted from the chat surface.

use core::fmt;

use serde::{Deserialize, Serialize};

use super::id::ConversationKey;
use super::identifier::{IdentifierError, ResourceSetId};

/// Errors produced while parsing command text.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// A query command carried no question.
    #[error("a question is required, e.g. `/cortalyst show ticket count by day`")]
    EmptyQuestion,
    /// The argument list had the wrong shape.
    #[error("expected `{expected}`, got `{got}`")]
    Usage {
        /// Expected argument form.
        expected: &'static str,
        /// Text actually received.
        got: String,
    },
    /// A database or schema name was not a valid identifier.
    #[error("invalid resource name: {0}")]
    Identifier(#[from] IdentifierError),
    /// The command name is not one the bot handles.
    #[error("unknown command `{0}`; try /setup, /cortalyst or /cleanup")]
    UnknownCommand(String),
}

/// The three operations the bot supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Create or verify the resource set.
    Setup {
        /// Resource set to provision.
        resource_set: ResourceSetId,
    },
    /// Ask the analyst a natural-language question.
    Query {
        /// Question text, flattened to a single line.
        question: String,
    },
    /// Destroy the resource set and the credential registration.
    Cleanup {
        /// Explicit resource set, or `None` for the conversation's own.
        resource_set: Option<ResourceSetId>,
    },
}

impl CommandKind {
    /// Parse a command by name and argument text.
    ///
    /// Names are accepted with or without the leading slash; `/ask` is an
    /// alias for `/cortalyst`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownCommand`] for unrecognised names, or the
    /// error of the per-command parser.
    pub fn parse(name: &str, text: &str) -> Result<Self, CommandError> {
        match name.trim().trim_start_matches('/') {
            "setup" => Self::parse_setup(text),
            "cortalyst" | "ask" => Self::parse_query(text),
            "cleanup" => Self::parse_cleanup(text),
            other => Err(CommandError::UnknownCommand(other.to_owned())),
        }
    }

    /// Parse `/setup` arguments: nothing, or `<database> <schema>`.
    ///
    /// # Errors
    ///
    /// Returns an error for any other argument count or invalid names.
    pub fn parse_setup(text: &str) -> Result<Self, CommandError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let resource_set = match words.as_slice() {
            [] => ResourceSetId::default(),
            [database, schema] => ResourceSetId::parse(database, schema)?,
            _ => {
                return Err(CommandError::Usage {
                    expected: "/setup [database schema]",
                    got: text.trim().to_owned(),
                });
            }
        };
        Ok(Self::Setup { resource_set })
    }

    /// Parse query text. Line breaks are folded into spaces.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::EmptyQuestion`] when the text is blank.
    pub fn parse_query(text: &str) -> Result<Self, CommandError> {
        let question = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if question.is_empty() {
            return Err(CommandError::EmptyQuestion);
        }
        Ok(Self::Query { question })
    }

    /// Parse `/cleanup` arguments: nothing, `<database>`, or `<database> <schema>`.
    ///
    /// # Errors
    ///
    /// Returns an error for more than two words or invalid names.
    pub fn parse_cleanup(text: &str) -> Result<Self, CommandError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let resource_set = match words.as_slice() {
            [] => None,
            [database] => Some(ResourceSetId::parse(
                database,
                ResourceSetId::DEFAULT_SCHEMA,
            )?),
            [database, schema] => Some(ResourceSetId::parse(database, schema)?),
            _ => {
                return Err(CommandError::Usage {
                    expected: "/cleanup [database [schema]]",
                    got: text.trim().to_owned(),
                });
            }
        };
        Ok(Self::Cleanup { resource_set })
    }

    /// Short name used in logs and replies.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::Query { .. } => "query",
            Self::Cleanup { .. } => "cleanup",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A command bound to the conversation it was issued in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Conversation the command belongs to.
    pub conversation: ConversationKey,
    /// What to do.
    pub kind: CommandKind,
}

impl Command {
    /// Bind a command kind to a conversation.
    #[must_use]
    pub const fn new(conversation: ConversationKey, kind: CommandKind) -> Self {
        Self { conversation, kind }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setup_defaults() {
        let kind = CommandKind::parse_setup("   ").unwrap();
        assert_eq!(
            kind,
            CommandKind::Setup {
                resource_set: ResourceSetId::default()
            }
        );
    }

    #[test]
    fn test_parse_setup_explicit() {
        let kind = CommandKind::parse_setup("sales  raw").unwrap();
        let CommandKind::Setup { resource_set } = kind else {
            panic!("expected setup");
        };
        assert_eq!(resource_set.to_string(), "sales.raw");
    }

    #[test]
    fn test_parse_setup_wrong_arity() {
        assert!(matches!(
            CommandKind::parse_setup("only_db"),
            Err(CommandError::Usage { .. })
        ));
        assert!(matches!(
            CommandKind::parse_setup("a b c"),
            Err(CommandError::Usage { .. })
        ));
    }

    #[test]
    fn test_parse_setup_invalid_name() {
        assert!(matches!(
            CommandKind::parse_setup("db; drop"),
            Err(CommandError::Identifier(_))
        ));
    }

    #[test]
    fn test_parse_query_flattens_lines() {
        let kind = CommandKind::parse_query("show ticket count\n  by day\n").unwrap();
        assert_eq!(
            kind,
            CommandKind::Query {
                question: "show ticket count by day".to_string()
            }
        );
    }

    #[test]
    fn test_parse_query_empty() {
        assert_eq!(
            CommandKind::parse_query(" \n "),
            Err(CommandError::EmptyQuestion)
        );
    }

    #[test]
    fn test_parse_cleanup_variants() {
        assert_eq!(
            CommandKind::parse_cleanup("").unwrap(),
            CommandKind::Cleanup { resource_set: None }
        );

        let CommandKind::Cleanup {
            resource_set: Some(id),
        } = CommandKind::parse_cleanup("sales").unwrap()
        else {
            panic!("expected explicit resource set");
        };
        assert_eq!(id.to_string(), "sales.data");

        assert!(CommandKind::parse_cleanup("a b c").is_err());
    }

    #[test]
    fn test_parse_by_name() {
        assert!(matches!(
            CommandKind::parse("/cortalyst", "tickets by day").unwrap(),
            CommandKind::Query { .. }
        ));
        assert!(matches!(
            CommandKind::parse("ask", "tickets by day").unwrap(),
            CommandKind::Query { .. }
        ));
        assert!(matches!(
            CommandKind::parse("/setup", "").unwrap(),
            CommandKind::Setup { .. }
        ));
        assert_eq!(
            CommandKind::parse("/deploy", ""),
            Err(CommandError::UnknownCommand("deploy".to_string()))
        );
    }

    #[test]
    fn test_command_names() {
        assert_eq!(CommandKind::parse_setup("").unwrap().name(), "setup");
        assert_eq!(CommandKind::parse_query("q").unwrap().name(), "query");
        assert_eq!(CommandKind::parse_cleanup("").unwrap().name(), "cleanup");
    }
}
