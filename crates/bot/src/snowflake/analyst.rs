//! Cortex Analyst answers, with generated SQL run through the SQL API.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::client::{Auth, ResultSet, SnowflakeClient, StatementOutcome};
use super::types::{AnalystContent, AnalystResponse};
use crate::analyst::{AnalystBackend, BackendAnswer, RawAnswer, RawTable};
use crate::backend::BackendError;
use crate::credential::BearerToken;
use crate::provision::SemanticModelRef;

/// Answers questions with the analyst endpoint.
///
/// The analyst only generates SQL; the statement is then submitted
/// asynchronously and its handle becomes the pending answer's handle.
#[derive(Debug, Clone)]
pub struct CortexAnalystBackend {
    client: SnowflakeClient,
}

impl CortexAnalystBackend {
    /// Create a backend over `client`.
    #[must_use]
    pub const fn new(client: SnowflakeClient) -> Self {
        Self { client }
    }
}

/// Flatten the analyst's content blocks.
///
/// Text blocks are joined with blank lines; only the first SQL block is kept.
fn decode_reply(response: AnalystResponse) -> RawAnswer {
    let mut text = Vec::new();
    let mut sql = None;
    let mut suggestions = Vec::new();

    for block in response.message.content {
        match block {
            AnalystContent::Text { text: t } if !t.trim().is_empty() => text.push(t),
            AnalystContent::Sql { statement } if sql.is_none() => sql = Some(statement),
            AnalystContent::Suggestions { suggestions: s } => suggestions.extend(s),
            _ => {}
        }
    }

    RawAnswer {
        narrative: (!text.is_empty()).then(|| text.join("\n\n")),
        sql,
        table: None,
        suggestions,
        warnings: response.warnings.into_iter().map(|w| w.message).collect(),
        request_id: response.request_id,
    }
}

fn raw_table(result: ResultSet) -> RawTable {
    RawTable {
        columns: result.columns,
        rows: result.rows,
        total_rows: result.total_rows,
    }
}

/// Fold a statement outcome into an answer, treating SQL failures as answers.
fn statement_answer(
    outcome: Result<StatementOutcome, BackendError>,
    mut draft: RawAnswer,
) -> Result<BackendAnswer, BackendError> {
    match outcome {
        Ok(StatementOutcome::Complete(result)) => {
            draft.table = Some(raw_table(result));
            Ok(BackendAnswer::Succeeded(draft))
        }
        Ok(StatementOutcome::Running { handle }) => Ok(BackendAnswer::Pending { handle, draft }),
        Err(BackendError::Failed {
            message,
            request_id,
        }) => Ok(BackendAnswer::Failed {
            detail: message,
            request_id: draft.request_id.or(request_id),
        }),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl AnalystBackend for CortexAnalystBackend {
    #[instrument(skip(self, question, token), fields(model = %semantic_model))]
    async fn submit(
        &self,
        question: &str,
        semantic_model: &SemanticModelRef,
        token: &BearerToken,
    ) -> Result<BackendAnswer, BackendError> {
        let response = self
            .client
            .analyst_message(question, &semantic_model.to_string(), token)
            .await?;
        let raw = decode_reply(response);

        let Some(sql) = raw.sql.clone() else {
            debug!("Analyst returned no SQL");
            return Ok(BackendAnswer::Succeeded(raw));
        };

        let outcome = self.client.execute(&sql, Auth::KeyPair(token)).await;
        statement_answer(outcome, raw)
    }

    #[instrument(skip(self, token))]
    async fn poll(&self, handle: &str, token: &BearerToken) -> Result<BackendAnswer, BackendError> {
        let outcome = self
            .client
            .statement_status(handle, Auth::KeyPair(token))
            .await;
        statement_answer(outcome, RawAnswer::default())
    }

    #[instrument(skip(self, token))]
    async fn cancel(&self, handle: &str, token: &BearerToken) -> Result<(), BackendError> {
        self.client
            .cancel_statement(handle, Auth::KeyPair(token))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn response(body: &str) -> AnalystResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_decode_reply_flattens_blocks() {
        let raw = decode_reply(response(
            r#"{
                "message": {"role": "analyst", "content": [
                    {"type": "text", "text": "This is our interpretation of your question:"},
                    {"type": "text", "text": "How many tickets per service type?"},
                    {"type": "sql", "statement": "SELECT service_type, COUNT(*) FROM t GROUP BY 1", "confidence": {}},
                    {"type": "sql", "statement": "SELECT 1"},
                    {"type": "chart", "spec": {}}
                ]},
                "request_id": "req-1",
                "warnings": [{"message": "table has no description"}]
            }"#,
        ));

        assert_eq!(
            raw.narrative.as_deref(),
            Some("This is our interpretation of your question:\n\nHow many tickets per service type?")
        );
        assert_eq!(
            raw.sql.as_deref(),
            Some("SELECT service_type, COUNT(*) FROM t GROUP BY 1")
        );
        assert_eq!(raw.warnings, vec!["table has no description"]);
        assert_eq!(raw.request_id.as_deref(), Some("req-1"));
        assert!(raw.table.is_none());
    }

    #[test]
    fn test_decode_reply_suggestions_only() {
        let raw = decode_reply(response(
            r#"{"message": {"content": [
                {"type": "text", "text": "Your question is ambiguous."},
                {"type": "suggestions", "suggestions": ["Tickets per day?", "Tickets per customer?"]}
            ]}}"#,
        ));
        assert!(raw.sql.is_none());
        assert_eq!(raw.suggestions.len(), 2);
    }

    #[test]
    fn test_statement_answer_complete() {
        let answer = statement_answer(
            Ok(StatementOutcome::Complete(ResultSet {
                columns: vec!["N".to_string()],
                rows: vec![vec![Some("5".to_string())]],
                total_rows: 1,
                statement_handle: Some("h".to_string()),
            })),
            RawAnswer {
                sql: Some("SELECT 5".to_string()),
                ..RawAnswer::default()
            },
        )
        .unwrap();

        let BackendAnswer::Succeeded(raw) = answer else {
            panic!("expected success");
        };
        assert_eq!(raw.sql.as_deref(), Some("SELECT 5"));
        assert_eq!(raw.table.unwrap().total_rows, 1);
    }

    #[test]
    fn test_statement_answer_running() {
        let answer = statement_answer(
            Ok(StatementOutcome::Running {
                handle: "01b2".to_string(),
            }),
            RawAnswer::default(),
        )
        .unwrap();
        assert!(matches!(answer, BackendAnswer::Pending { handle, .. } if handle == "01b2"));
    }

    #[test]
    fn test_statement_answer_sql_failure_is_an_answer() {
        let answer = statement_answer(
            Err(BackendError::Failed {
                message: "invalid identifier".to_string(),
                request_id: Some("01b2".to_string()),
            }),
            RawAnswer::default(),
        )
        .unwrap();
        assert_eq!(
            answer,
            BackendAnswer::Failed {
                detail: "invalid identifier".to_string(),
                request_id: Some("01b2".to_string()),
            }
        );
    }

    #[test]
    fn test_statement_answer_propagates_auth_failure() {
        let err = statement_answer(
            Err(BackendError::Unauthorized("expired".to_string())),
            RawAnswer::default(),
        )
        .unwrap_err();
        assert!(err.is_unauthorized());
    }
}
