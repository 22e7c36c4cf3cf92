//! Wire types for the SQL API and the analyst message endpoint.

use serde::{Deserialize, Serialize};

// =============================================================================
// SQL API
// =============================================================================

/// Body of `POST /api/v2/statements`.
#[derive(Debug, Serialize)]
pub struct StatementRequest<'a> {
    /// SQL text.
    pub statement: &'a str,
    /// Server-side timeout in seconds.
    pub timeout: u64,
    /// Warehouse override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<&'a str>,
    /// Role override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'a str>,
}

/// Response of the statement endpoints, for any status code.
///
/// A `200` carries the metadata and the first result partition; a `202`
/// carries only the handle; errors carry `code`, `message` and `sqlState`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementResponse {
    /// Snowflake response code (e.g. `090001` success, `333334` running).
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Handle for polling or cancelling the statement.
    #[serde(default)]
    pub statement_handle: Option<String>,
    /// ANSI SQL state on failure.
    #[serde(default)]
    pub sql_state: Option<String>,
    /// Result metadata, present on success.
    #[serde(default)]
    pub result_set_meta_data: Option<ResultSetMetaData>,
    /// Rows of the first partition; every value is a string or null.
    #[serde(default)]
    pub data: Vec<Vec<Option<String>>>,
}

/// Shape of a result set.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSetMetaData {
    /// Total row count across all partitions.
    #[serde(default)]
    pub num_rows: usize,
    /// Column descriptions, in order.
    #[serde(default)]
    pub row_type: Vec<RowType>,
}

/// One column description.
#[derive(Debug, Deserialize)]
pub struct RowType {
    /// Column name.
    pub name: String,
}

// =============================================================================
// Analyst
// =============================================================================

/// Body of `POST /api/v2/cortex/analyst/message`.
#[derive(Debug, Serialize)]
pub struct AnalystRequest<'a> {
    /// Conversation so far; the bot always sends a single user turn.
    pub messages: Vec<AnalystMessage<'a>>,
    /// Staged semantic model, `@db.schema.stage/file`.
    pub semantic_model_file: &'a str,
}

impl<'a> AnalystRequest<'a> {
    /// Build a single-question request.
    #[must_use]
    pub fn question(question: &'a str, semantic_model_file: &'a str) -> Self {
        Self {
            messages: vec![AnalystMessage {
                role: "user",
                content: vec![AnalystRequestContent {
                    kind: "text",
                    text: question,
                }],
            }],
            semantic_model_file,
        }
    }
}

/// One conversation turn in a request.
#[derive(Debug, Serialize)]
pub struct AnalystMessage<'a> {
    /// `user` or `analyst`.
    pub role: &'a str,
    /// Content blocks.
    pub content: Vec<AnalystRequestContent<'a>>,
}

/// A text block in a request.
#[derive(Debug, Serialize)]
pub struct AnalystRequestContent<'a> {
    /// Always `text`.
    #[serde(rename = "type")]
    pub kind: &'a str,
    /// The text.
    pub text: &'a str,
}

/// Successful analyst response.
#[derive(Debug, Deserialize)]
pub struct AnalystResponse {
    /// The analyst's turn.
    pub message: AnalystReply,
    /// Backend request ID.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Non-fatal warnings about the semantic model or the question.
    #[serde(default)]
    pub warnings: Vec<AnalystWarning>,
}

/// The analyst's turn.
#[derive(Debug, Deserialize)]
pub struct AnalystReply {
    /// Content blocks, in display order.
    #[serde(default)]
    pub content: Vec<AnalystContent>,
}

/// One content block of an analyst reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalystContent {
    /// Narrative text.
    Text {
        /// The text.
        text: String,
    },
    /// Generated SQL.
    Sql {
        /// The statement, exactly as generated.
        statement: String,
    },
    /// Follow-up questions offered when the question was ambiguous.
    Suggestions {
        /// Suggested questions.
        suggestions: Vec<String>,
    },
    /// Block types the bot does not render.
    #[serde(other)]
    Unknown,
}

/// A warning attached to an analyst response.
#[derive(Debug, Deserialize)]
pub struct AnalystWarning {
    /// Warning text.
    pub message: String,
}

/// Error body returned by the analyst endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct AnalystErrorBody {
    /// Error message.
    #[serde(default)]
    pub message: Option<String>,
    /// Error code.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Backend request ID.
    #[serde(default)]
    pub request_id: Option<String>,
}
