//! Slack Block Kit types and Web API payloads.
//!
//! These types represent the subset of Block Kit the bot renders replies
//! with: headers, sections, context lines and dividers.
//!
//! See: <https://api.slack.com/block-kit>

use serde::{Deserialize, Serialize};

/// Maximum length of a section's text.
pub const SECTION_TEXT_LIMIT: usize = 3000;

/// Maximum length of a header's text.
pub const HEADER_TEXT_LIMIT: usize = 150;

/// A message posted with `chat.postMessage`.
#[derive(Debug, Clone, Serialize)]
pub struct SlackMessage<'a> {
    /// Channel ID to post to.
    pub channel: &'a str,
    /// Thread to reply in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<&'a str>,
    /// Message blocks.
    pub blocks: &'a [Block],
    /// Plain text fallback for notifications.
    pub text: &'a str,
}

/// One chat message: blocks plus the notification fallback text.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPayload {
    /// Message blocks.
    pub blocks: Vec<Block>,
    /// Plain text fallback.
    pub text: String,
}

impl ChatPayload {
    /// Create a payload.
    #[must_use]
    pub fn new(text: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            text: text.into(),
        }
    }
}

/// Block Kit block types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    /// Header block with large text.
    Header { text: PlainText },
    /// Section block with text.
    Section { text: Text },
    /// Context block with small muted text.
    Context { elements: Vec<ContextElement> },
    /// Divider block (horizontal line).
    Divider,
}

impl Block {
    /// A header, truncated to the header limit.
    #[must_use]
    pub fn header(text: impl Into<String>) -> Self {
        Self::Header {
            text: PlainText::new(truncate_chars(&text.into(), HEADER_TEXT_LIMIT)),
        }
    }

    /// A markdown section, truncated to the section limit.
    #[must_use]
    pub fn section(text: impl Into<String>) -> Self {
        Self::Section {
            text: Text::mrkdwn(truncate_chars(&text.into(), SECTION_TEXT_LIMIT)),
        }
    }

    /// Markdown sections carrying all of `text`, split at the section limit.
    #[must_use]
    pub fn sections(text: &str) -> Vec<Self> {
        split_chars(text, SECTION_TEXT_LIMIT)
            .into_iter()
            .map(|piece| Self::Section {
                text: Text::mrkdwn(piece),
            })
            .collect()
    }

    /// Sections showing `code` in fenced blocks under `title`.
    ///
    /// Long code is spread over several sections, each fenced on its own, so
    /// nothing is cut.
    #[must_use]
    pub fn code_sections(title: &str, code: &str) -> Vec<Self> {
        // Title line plus the two fences
        let overhead = title.chars().count() + 1 + 6;
        split_chars(code, SECTION_TEXT_LIMIT.saturating_sub(overhead))
            .into_iter()
            .enumerate()
            .map(|(i, piece)| {
                let text = if i == 0 {
                    format!("{title}\n```{piece}```")
                } else {
                    format!("```{piece}```")
                };
                Self::Section {
                    text: Text::mrkdwn(text),
                }
            })
            .collect()
    }

    /// A single-line markdown context block.
    #[must_use]
    pub fn context(text: impl Into<String>) -> Self {
        Self::Context {
            elements: vec![ContextElement::Mrkdwn { text: text.into() }],
        }
    }
}

/// Text object types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Text {
    /// Plain text (no formatting).
    PlainText { text: String, emoji: bool },
    /// Markdown text (supports formatting).
    Mrkdwn { text: String },
}

impl Text {
    /// Create a plain text object.
    #[must_use]
    pub fn plain(text: impl Into<String>) -> Self {
        Self::PlainText {
            text: text.into(),
            emoji: true,
        }
    }

    /// Create a markdown text object.
    #[must_use]
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self::Mrkdwn { text: text.into() }
    }

    /// The text content.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PlainText { text, .. } | Self::Mrkdwn { text } => text,
        }
    }
}

/// Plain text object (for headers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlainText {
    #[serde(rename = "type")]
    pub text_type: &'static str,
    pub text: String,
    pub emoji: bool,
}

impl PlainText {
    /// Create a new plain text object.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text_type: "plain_text",
            text: text.into(),
            emoji: true,
        }
    }
}

/// Context block elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextElement {
    /// Markdown text in context.
    Mrkdwn { text: String },
    /// Plain text in context.
    PlainText { text: String, emoji: bool },
}

/// Visibility of a `response_url` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Only the invoking user sees it.
    Ephemeral,
    /// Everyone in the channel sees it.
    InChannel,
}

/// Cut `text` to at most `limit` characters, marking the cut.
pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit.saturating_sub(1)) {
        Some((idx, _)) if text.chars().count() > limit => {
            format!("{}…", text.get(..idx).unwrap_or(text))
        }
        _ => text.to_string(),
    }
}

/// Split `text` into pieces of at most `limit` characters that concatenate
/// back to `text`, cutting after a line break or a space where possible.
pub(crate) fn split_chars(text: &str, limit: usize) -> Vec<&str> {
    let limit = limit.max(1);
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some((hard, _)) = rest.char_indices().nth(limit) {
        let window = rest.get(..hard).unwrap_or(rest);
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map_or(hard, |i| i + 1);
        let (piece, tail) = rest.split_at_checked(cut).unwrap_or((rest, ""));
        pieces.push(piece);
        rest = tail;
    }
    if !rest.is_empty() || pieces.is_empty() {
        pieces.push(rest);
    }
    pieces
}

// =============================================================================
// Response Types
// =============================================================================

/// Response from posting a message.
#[derive(Debug, Clone, Deserialize)]
pub struct PostMessageResponse {
    /// Whether the request was successful.
    pub ok: bool,
    /// Channel ID where message was posted.
    #[serde(default)]
    pub channel: Option<String>,
    /// Message timestamp (unique ID).
    #[serde(default)]
    pub ts: Option<String>,
    /// Error message if not ok.
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_block_serialization() {
        let json = serde_json::to_value(Block::section("*hi*")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "section", "text": {"type": "mrkdwn", "text": "*hi*"}})
        );
        let json = serde_json::to_value(Block::Divider).unwrap();
        assert_eq!(json, serde_json::json!({"type": "divider"}));
    }

    #[test]
    fn test_message_omits_missing_thread() {
        let blocks = [Block::Divider];
        let message = SlackMessage {
            channel: "C1",
            thread_ts: None,
            blocks: &blocks,
            text: "hi",
        };
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("thread_ts").is_none());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 4), "abc…");
        assert_eq!(truncate_chars("abcd", 4), "abcd");
        assert_eq!(truncate_chars(&"é".repeat(10), 3).chars().count(), 3);
    }

    #[test]
    fn test_split_chars_keeps_every_character() {
        let text = "SELECT a,\nb FROM t WHERE x = 'é é é'";
        for limit in 1..text.chars().count() + 2 {
            let pieces = split_chars(text, limit);
            assert_eq!(pieces.concat(), text);
            assert!(pieces.iter().all(|p| p.chars().count() <= limit));
        }
        assert_eq!(split_chars("", 10), vec![""]);
        assert_eq!(split_chars("ab cd", 3), vec!["ab ", "cd"]);
        assert_eq!(split_chars("ab\ncd ef", 6), vec!["ab\n", "cd ef"]);
    }

    #[test]
    fn test_code_sections_fence_each_part() {
        let code = "x".repeat(SECTION_TEXT_LIMIT * 2);
        let blocks = Block::code_sections("*SQL*", &code);
        assert_eq!(blocks.len(), 3);

        let mut joined = String::new();
        for (i, block) in blocks.iter().enumerate() {
            let Block::Section { text } = block else {
                panic!("expected section");
            };
            let text = text.as_str();
            assert!(text.chars().count() <= SECTION_TEXT_LIMIT);
            let body = if i == 0 {
                text.strip_prefix("*SQL*\n").unwrap()
            } else {
                text
            };
            joined.push_str(body.strip_prefix("```").unwrap().strip_suffix("```").unwrap());
        }
        assert_eq!(joined, code);
    }
}
