//! Query requests, results and backend answers.

use chrono::{DateTime, Utc};
use demo_mate_core::{ConversationKey, CorrelationId, QueryStatus};
use serde::Serialize;

use super::QueryError;

/// A question submitted for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Question text, single line.
    pub question: String,
    /// Conversation it was asked in.
    pub conversation: ConversationKey,
    /// When it was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Ties log lines and replies to this request.
    pub correlation_id: CorrelationId,
}

impl QueryRequest {
    /// Create a request stamped with the current time and a fresh correlation ID.
    #[must_use]
    pub fn new(question: impl Into<String>, conversation: ConversationKey) -> Self {
        Self {
            question: question.into(),
            conversation,
            submitted_at: Utc::now(),
            correlation_id: CorrelationId::new(),
        }
    }
}

/// Tabular result as the backend returned it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows returned.
    pub rows: Vec<Vec<Option<String>>>,
    /// Total rows the query produced.
    pub total_rows: usize,
}

/// Answer content decoded from the backend, before formatting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAnswer {
    /// Narrative text.
    pub narrative: Option<String>,
    /// Generated SQL.
    pub sql: Option<String>,
    /// Result of running the SQL.
    pub table: Option<RawTable>,
    /// Follow-up questions.
    pub suggestions: Vec<String>,
    /// Backend warnings.
    pub warnings: Vec<String>,
    /// Backend request ID.
    pub request_id: Option<String>,
}

/// A backend answer decoded at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAnswer {
    /// Still running. `draft` holds whatever is already known (narrative and
    /// SQL); polling fills in the table.
    Pending {
        /// Handle for polling or cancelling.
        handle: String,
        /// Content known so far.
        draft: RawAnswer,
    },
    /// Finished. When polling, only the table is meaningful.
    Succeeded(RawAnswer),
    /// The backend failed the query.
    Failed {
        /// Backend detail.
        detail: String,
        /// Backend request ID.
        request_id: Option<String>,
    },
}

/// Tabular preview, capped to a fixed number of rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePreview {
    /// Column names.
    pub columns: Vec<String>,
    /// At most the row cap.
    pub rows: Vec<Vec<Option<String>>>,
    /// Total rows the query produced.
    pub total_rows: usize,
    /// Whether rows were dropped.
    pub truncated: bool,
}

impl TablePreview {
    /// Cap `table` to `row_cap` rows.
    #[must_use]
    pub fn new(table: RawTable, row_cap: usize) -> Self {
        let RawTable {
            columns,
            mut rows,
            total_rows,
        } = table;
        let total_rows = total_rows.max(rows.len());
        rows.truncate(row_cap);
        Self {
            truncated: total_rows > rows.len(),
            columns,
            rows,
            total_rows,
        }
    }
}

/// Formatted answer ready for rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructuredAnswer {
    /// Narrative text, verbatim.
    pub narrative: Option<String>,
    /// SQL, exactly as generated.
    pub sql: Option<String>,
    /// Table preview.
    pub table: Option<TablePreview>,
    /// Follow-up questions.
    pub suggestions: Vec<String>,
    /// Backend warnings.
    pub warnings: Vec<String>,
    /// Backend request ID.
    pub request_id: Option<String>,
}

impl StructuredAnswer {
    /// Format a raw answer.
    #[must_use]
    pub fn from_raw(raw: RawAnswer, row_cap: usize) -> Self {
        Self {
            narrative: raw.narrative,
            sql: raw.sql,
            table: raw.table.map(|table| TablePreview::new(table, row_cap)),
            suggestions: raw.suggestions,
            warnings: raw.warnings,
            request_id: raw.request_id,
        }
    }
}

/// Terminal outcome of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Request this answers.
    pub correlation_id: CorrelationId,
    /// Succeeded or Failed.
    pub status: QueryStatus,
    /// Present on success.
    pub answer: Option<StructuredAnswer>,
    /// Present on failure.
    pub error: Option<QueryError>,
}

impl QueryResult {
    /// A successful result.
    #[must_use]
    pub const fn succeeded(correlation_id: CorrelationId, answer: StructuredAnswer) -> Self {
        Self {
            correlation_id,
            status: QueryStatus::Succeeded,
            answer: Some(answer),
            error: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub const fn failed(correlation_id: CorrelationId, error: QueryError) -> Self {
        Self {
            correlation_id,
            status: QueryStatus::Failed,
            answer: None,
            error: Some(error),
        }
    }

    /// Convert into the answer, or the error for a failed result.
    ///
    /// # Errors
    ///
    /// Returns the recorded error when the query failed.
    pub fn into_answer(self) -> Result<StructuredAnswer, QueryError> {
        match (self.answer, self.error) {
            (Some(answer), None) => Ok(answer),
            (_, Some(error)) => Err(error),
            (None, None) => Err(QueryError::BackendFailed {
                detail: "empty result".to_string(),
                request_id: None,
            }),
        }
    }
}
