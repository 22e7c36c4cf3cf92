//! Slack message builders for command replies.
//!
//! [`render`] turns a [`Reply`] into the ordered messages posted back into
//! the conversation; [`render_ack`] builds the message posted while a
//! command runs. Both are pure.

use demo_mate_core::{Command, CommandKind};

use super::types::{Block, ChatPayload, SECTION_TEXT_LIMIT};
use crate::analyst::{QueryError, QueryResult, StructuredAnswer, TablePreview};
use crate::credential::CredentialError;
use crate::error::BotError;
use crate::provision::{ProvisionError, ProvisionStep, StepProgress};
use crate::session::{Reply, SessionError};

/// Widest a table cell is rendered before it is cut.
const MAX_CELL_WIDTH: usize = 40;

/// Rendered for SQL nulls.
const NULL: &str = "NULL";

/// Build the "working on it" message for `command`.
#[must_use]
pub fn render_ack(command: &Command) -> ChatPayload {
    let text = match &command.kind {
        CommandKind::Setup { resource_set } => {
            format!(":hourglass_flowing_sand: Setting up `{resource_set}`. This can take a minute.")
        }
        CommandKind::Query { question } => {
            format!(":mag: Looking into: _{}_", escape(question))
        }
        CommandKind::Cleanup {
            resource_set: Some(resource_set),
        } => format!(":broom: Cleaning up `{resource_set}`."),
        CommandKind::Cleanup { resource_set: None } => {
            ":broom: Cleaning up this conversation's resources.".to_string()
        }
    };
    ChatPayload::new(text.clone(), vec![Block::section(text)])
}

/// Build the message posted when a setup step finishes.
#[must_use]
pub fn render_progress(progress: &StepProgress) -> ChatPayload {
    let text = if progress.created {
        format!(":white_check_mark: Created {}", progress.resource)
    } else {
        format!(":ballot_box_with_check: Found existing {}", progress.resource)
    };
    ChatPayload::new(text.clone(), vec![Block::context(text)])
}

/// Build the messages for a command's outcome, in posting order.
#[must_use]
pub fn render(reply: &Reply) -> Vec<ChatPayload> {
    match reply {
        Reply::SetupComplete {
            resource_set,
            fingerprint,
        } => vec![ChatPayload::new(
            format!("Setup complete: {resource_set} is ready"),
            vec![
                Block::header(":white_check_mark: Setup complete"),
                Block::section(format!(
                    "Resource set `{resource_set}` is ready. Ask a question with `/cortalyst <question>`."
                )),
                Block::context(format!("Key fingerprint `{fingerprint}`")),
            ],
        )],

        Reply::Answer { question, result } => render_answer(question, result),

        Reply::CleanupComplete {
            resource_set,
            cancelled_query,
        } => {
            let mut blocks = vec![
                Block::header(":wastebasket: Cleanup complete"),
                Block::section(format!(
                    "Resource set `{resource_set}` was removed and the bot's key registration was cleared."
                )),
            ];
            if *cancelled_query {
                blocks.push(Block::context("A running query was cancelled."));
            }
            vec![ChatPayload::new(
                format!("Cleanup complete: {resource_set} removed"),
                blocks,
            )]
        }

        Reply::Failed {
            operation, error, ..
        } => vec![render_error(operation, error)],
    }
}

// =============================================================================
// Answers
// =============================================================================

fn render_answer(question: &str, result: &QueryResult) -> Vec<ChatPayload> {
    let Some(answer) = &result.answer else {
        return vec![ChatPayload::new(
            "The analyst returned no answer",
            vec![Block::section("The analyst returned no answer.")],
        )];
    };

    let mut payloads = vec![summary_payload(question, answer)];

    if let Some(table) = &answer.table {
        payloads.push(table_payload(table));
    }

    if !answer.suggestions.is_empty() {
        let list = answer
            .suggestions
            .iter()
            .map(|s| format!("• {}", escape(s)))
            .collect::<Vec<_>>()
            .join("\n");
        payloads.push(ChatPayload::new(
            "Suggested questions",
            vec![Block::section(format!("*Try asking:*\n{list}"))],
        ));
    }

    let mut footer = vec![format!("Correlation ID `{}`", result.correlation_id)];
    if let Some(request_id) = &answer.request_id {
        footer.push(format!("request `{request_id}`"));
    }
    if let Some(last) = payloads.last_mut() {
        last.blocks.push(Block::context(footer.join(" · ")));
    }

    payloads
}

fn summary_payload(question: &str, answer: &StructuredAnswer) -> ChatPayload {
    let mut blocks = vec![Block::header(format!(":speech_balloon: {question}"))];

    if let Some(narrative) = &answer.narrative {
        blocks.extend(Block::sections(narrative));
    }

    if let Some(sql) = &answer.sql {
        blocks.extend(Block::code_sections("*SQL*", sql));
    }

    for warning in &answer.warnings {
        blocks.push(Block::context(format!(":warning: {}", escape(warning))));
    }

    let text = answer
        .narrative
        .clone()
        .unwrap_or_else(|| format!("Answer to: {question}"));
    ChatPayload::new(text, blocks)
}

fn table_payload(table: &TablePreview) -> ChatPayload {
    let mut rows = table.rows.len();
    let mut rendered = format_table(table, rows);
    // Drop rows until the code block fits in one section
    while rendered.chars().count() + 6 > SECTION_TEXT_LIMIT && rows > 0 {
        rows -= 1;
        rendered = format_table(table, rows);
    }

    let caption = if rows < table.total_rows {
        format!("Showing {rows} of {} rows", table.total_rows)
    } else {
        format!("{rows} row{}", if rows == 1 { "" } else { "s" })
    };

    ChatPayload::new(
        caption.clone(),
        vec![
            Block::section(format!("```{rendered}```")),
            Block::context(caption),
        ],
    )
}

/// Lay out the first `rows` rows of `table` as aligned monospaced text.
fn format_table(table: &TablePreview, rows: usize) -> String {
    let cells: Vec<Vec<String>> = table
        .rows
        .iter()
        .take(rows)
        .map(|row| {
            (0..table.columns.len())
                .map(|i| cell(row.get(i).and_then(Option::as_deref)))
                .collect()
        })
        .collect();

    let widths: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .filter_map(|row| row.get(i))
                .map(|c| c.chars().count())
                .chain(std::iter::once(name.chars().count().min(MAX_CELL_WIDTH)))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| {
        values
            .iter()
            .zip(&widths)
            .map(|(value, &width)| format!("{value:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let header: Vec<String> = table.columns.iter().map(|c| clip(c)).collect();
    let separator = widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>()
        .join("-+-");

    let mut out = vec![line(&header), separator];
    out.extend(cells.iter().map(|row| line(row)));
    out.join("\n")
}

fn cell(value: Option<&str>) -> String {
    clip(value.unwrap_or(NULL))
}

fn clip(value: &str) -> String {
    let value = value.replace(['\n', '\r'], " ");
    super::types::truncate_chars(&value, MAX_CELL_WIDTH)
}

// =============================================================================
// Errors
// =============================================================================

fn render_error(operation: &str, error: &BotError) -> ChatPayload {
    let (title, body) = describe(error);
    ChatPayload::new(
        format!("{operation} failed: {title}"),
        vec![
            Block::header(format!(":x: {title}")),
            Block::section(body),
            Block::context(format!("Command `{operation}`")),
        ],
    )
}

/// Title and body naming the failed step and the backend detail.
fn describe(error: &BotError) -> (String, String) {
    match error {
        BotError::Credential(e) => (
            "Credential step failed".to_string(),
            match e {
                CredentialError::RegistrationFailed { detail, .. } => {
                    format!("Registering the bot's public key failed: {detail}")
                }
                other => other.to_string(),
            },
        ),

        BotError::Provision(ProvisionError::PartialFailure {
            completed_steps,
            failed_step,
            cause,
        }) => (
            format!("Setup failed at the {failed_step} step"),
            format!(
                "{}\n*Completed:* {}\nRun `/setup` again to resume, or `/cleanup` to remove what was created.",
                detail_line(&cause.to_string()),
                steps(completed_steps),
            ),
        ),
        BotError::Provision(ProvisionError::TeardownIncomplete {
            remaining, detail, ..
        }) => (
            "Cleanup incomplete".to_string(),
            format!(
                "These objects still exist: {}\n{}Run `/cleanup` again to retry.",
                remaining
                    .iter()
                    .map(|r| format!("`{r}`"))
                    .collect::<Vec<_>>()
                    .join(", "),
                detail
                    .as_deref()
                    .map(|d| format!("{}\n", detail_line(d)))
                    .unwrap_or_default(),
            ),
        ),
        BotError::Provision(e @ ProvisionError::Conflict { .. }) => (
            "Resource set busy".to_string(),
            e.to_string(),
        ),
        BotError::Provision(e) => ("Provisioning failed".to_string(), e.to_string()),

        BotError::Query(QueryError::AuthFailed(detail)) => (
            "Authentication failed".to_string(),
            format!(
                "The warehouse rejected the bot's token even after a refresh.\n{}",
                detail_line(detail)
            ),
        ),
        BotError::Query(QueryError::BackendFailed { detail, request_id }) => (
            "The analyst could not answer".to_string(),
            match request_id {
                Some(id) => format!("{}\n*Request ID:* `{id}`", detail_line(detail)),
                None => detail_line(detail),
            },
        ),
        BotError::Query(e @ QueryError::Timeout { .. }) => (
            "Query timed out".to_string(),
            format!("{e}. The query may still finish in the warehouse."),
        ),
        BotError::Query(QueryError::Cancelled) => (
            "Query cancelled".to_string(),
            "The query was cancelled by a cleanup in this conversation.".to_string(),
        ),

        BotError::Session(e @ SessionError::Busy { .. }) => ("Busy".to_string(), e.to_string()),
        BotError::Session(e @ SessionError::NotReady) => ("Not set up".to_string(), e.to_string()),

        BotError::Command(e) => ("Invalid command".to_string(), e.to_string()),

        other => ("Something went wrong".to_string(), detail_line(&other.to_string())),
    }
}

fn detail_line(detail: &str) -> String {
    format!("*Detail:* {}", escape(detail))
}

fn steps(steps: &[ProvisionStep]) -> String {
    if steps.is_empty() {
        return "nothing".to_string();
    }
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Escape the characters Slack treats as control sequences.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use demo_mate_core::{ConversationKey, CorrelationId, ResourceSetId};

    use super::*;
    use crate::backend::BackendError;
    use crate::provision::{ResourceRef, StepError};
    use crate::slack::types::ContextElement;

    fn section_text(block: &Block) -> &str {
        match block {
            Block::Section { text } => text.as_str(),
            Block::Header { text } => &text.text,
            _ => "",
        }
    }

    fn all_text(payloads: &[ChatPayload]) -> String {
        payloads
            .iter()
            .flat_map(|p| &p.blocks)
            .map(|b| match b {
                Block::Context { elements } => elements
                    .iter()
                    .map(|e| match e {
                        ContextElement::Mrkdwn { text } | ContextElement::PlainText { text, .. } => {
                            text.clone()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                other => section_text(other).to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn failed(error: BotError) -> Reply {
        Reply::Failed {
            conversation: ConversationKey::channel("C1"),
            operation: "setup",
            error,
        }
    }

    fn preview(rows: usize, total: usize) -> TablePreview {
        TablePreview {
            columns: vec!["SERVICE_TYPE".to_string(), "TICKETS".to_string()],
            rows: (0..rows)
                .map(|i| vec![Some(format!("type-{i}")), Some(i.to_string())])
                .collect(),
            total_rows: total,
            truncated: total > rows,
        }
    }

    #[test]
    fn test_ack_names_resource_set() {
        let ack = render_ack(&Command::new(
            ConversationKey::channel("C1"),
            CommandKind::Setup {
                resource_set: ResourceSetId::default(),
            },
        ));
        assert!(ack.text.contains("`demo_db.data`"));
    }

    #[test]
    fn test_progress_names_object() {
        let created = render_progress(&StepProgress {
            resource: ResourceRef::Namespace(ResourceSetId::default()),
            created: true,
        });
        assert_eq!(created.text, ":white_check_mark: Created schema demo_db.data");

        let found = render_progress(&StepProgress {
            resource: ResourceRef::Namespace(ResourceSetId::default()),
            created: false,
        });
        assert!(found.text.contains("Found existing schema demo_db.data"));
    }

    #[test]
    fn test_setup_complete_names_resource_set() {
        let payloads = render(&Reply::SetupComplete {
            resource_set: ResourceSetId::default(),
            fingerprint: crate::credential::Fingerprint::of_der(b"spki"),
        });
        assert_eq!(payloads.len(), 1);
        let text = all_text(&payloads);
        assert!(text.contains("Setup complete"));
        assert!(text.contains("`demo_db.data`"));
        assert!(text.contains("SHA256:"));
    }

    #[test]
    fn test_answer_renders_narrative_sql_and_table_in_order() {
        let payloads = render(&Reply::Answer {
            question: "tickets per service type?".to_string(),
            result: QueryResult::succeeded(
                CorrelationId::new(),
                StructuredAnswer {
                    narrative: Some("Tickets grouped by service type".to_string()),
                    sql: Some("SELECT service_type, COUNT(*) FROM support_tickets GROUP BY 1".to_string()),
                    table: Some(preview(5, 5)),
                    ..StructuredAnswer::default()
                },
            ),
        });

        assert_eq!(payloads.len(), 2);
        let summary = all_text(&payloads[..1]);
        assert!(summary.contains("Tickets grouped by service type"));
        assert!(summary.contains("```SELECT service_type"));

        let table = section_text(&payloads[1].blocks[0]);
        assert!(table.starts_with("```SERVICE_TYPE | TICKETS"));
        assert_eq!(table.matches("type-").count(), 5);
        assert_eq!(payloads[1].text, "5 rows");
    }

    #[test]
    fn test_long_sql_and_narrative_are_rendered_whole() {
        let columns = (0..600).map(|i| format!("c{i}")).collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT {columns} FROM t");
        assert!(sql.len() > 3500);
        let narrative = "The warehouse returned every requested column. ".repeat(80);

        let payloads = render(&Reply::Answer {
            question: "all columns".to_string(),
            result: QueryResult::succeeded(
                CorrelationId::new(),
                StructuredAnswer {
                    narrative: Some(narrative.clone()),
                    sql: Some(sql.clone()),
                    ..StructuredAnswer::default()
                },
            ),
        });

        let sections: Vec<&str> = payloads[0]
            .blocks
            .iter()
            .filter(|b| matches!(b, Block::Section { .. }))
            .map(section_text)
            .collect();
        assert!(sections.iter().all(|s| s.chars().count() <= SECTION_TEXT_LIMIT));

        let sql_start = sections.iter().position(|s| s.starts_with("*SQL*")).unwrap();
        let shown_narrative: String = sections[..sql_start].concat();
        assert_eq!(shown_narrative, narrative);

        let shown_sql: String = sections[sql_start..]
            .iter()
            .map(|s| {
                s.trim_start_matches("*SQL*\n")
                    .strip_prefix("```")
                    .and_then(|s| s.strip_suffix("```"))
                    .unwrap()
            })
            .collect();
        assert_eq!(shown_sql, sql);
    }

    #[test]
    fn test_truncated_table_caption() {
        let payload = table_payload(&preview(20, 25));
        assert_eq!(payload.text, "Showing 20 of 25 rows");
    }

    #[test]
    fn test_table_layout() {
        let table = TablePreview {
            columns: vec!["A".to_string(), "LONG_NAME".to_string()],
            rows: vec![
                vec![Some("xyz".to_string()), None],
                vec![Some("q".to_string()), Some("1".to_string())],
            ],
            total_rows: 2,
            truncated: false,
        };
        assert_eq!(
            format_table(&table, 2),
            "A   | LONG_NAME\n----+----------\nxyz | NULL\nq   | 1"
        );
    }

    #[test]
    fn test_oversized_table_fits_one_section() {
        let table = TablePreview {
            columns: vec!["TEXT".to_string()],
            rows: (0..200).map(|_| vec![Some("x".repeat(60))]).collect(),
            total_rows: 200,
            truncated: false,
        };
        let payload = table_payload(&table);
        assert!(section_text(&payload.blocks[0]).chars().count() <= SECTION_TEXT_LIMIT);
        assert!(payload.text.starts_with("Showing "));
    }

    #[test]
    fn test_partial_failure_names_step_and_detail() {
        let payloads = render(&failed(BotError::Provision(ProvisionError::PartialFailure {
            completed_steps: vec![ProvisionStep::Namespace],
            failed_step: ProvisionStep::StorageLocation,
            cause: StepError::Backend(BackendError::failed("Insufficient privileges")),
        })));
        let text = all_text(&payloads);
        assert!(text.contains("Setup failed at the storage location step"));
        assert!(text.contains("*Completed:* namespace"));
        assert!(text.contains("Insufficient privileges"));
    }

    #[test]
    fn test_backend_failure_includes_request_id() {
        let payloads = render(&failed(BotError::Query(QueryError::BackendFailed {
            detail: "invalid identifier 'X'".to_string(),
            request_id: Some("req-7".to_string()),
        })));
        let text = all_text(&payloads);
        assert!(text.contains("invalid identifier"));
        assert!(text.contains("`req-7`"));
    }

    #[test]
    fn test_credential_error_has_no_key_material() {
        let payloads = render(&failed(BotError::Credential(
            CredentialError::RegistrationFailed {
                retryable: false,
                detail: "Insufficient privileges to operate on user".to_string(),
            },
        )));
        let text = all_text(&payloads);
        assert!(text.contains("Credential step failed"));
        assert!(!text.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_session_errors() {
        let text = all_text(&render(&failed(BotError::Session(SessionError::NotReady))));
        assert!(text.contains("/setup"));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }
}
