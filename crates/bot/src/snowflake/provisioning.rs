//! Provisioning through SQL API statements.

use std::time::Duration;

use async_trait::async_trait;
use demo_mate_core::{ResourceSetId, SqlIdentifier};
use tracing::{debug, instrument};

use super::client::{Auth, ResultSet, SnowflakeClient};
use crate::backend::BackendError;
use crate::credential::BearerToken;
use crate::provision::{ProvisioningBackend, ResourceRef, SemanticModelRef};

/// Comment attached to every created object.
const CREATED_BY: &str = "created by slack bot setup";

/// Creates and removes resource-set objects with DDL statements.
#[derive(Debug, Clone)]
pub struct SnowflakeProvisioningBackend {
    client: SnowflakeClient,
    poll_interval: Duration,
}

impl SnowflakeProvisioningBackend {
    /// Create a backend issuing statements through `client`.
    #[must_use]
    pub const fn new(client: SnowflakeClient, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    async fn run(&self, statement: &str, token: &BearerToken) -> Result<ResultSet, BackendError> {
        debug!(statement, "Executing");
        self.client
            .execute_to_completion(statement, Auth::KeyPair(token), self.poll_interval)
            .await
    }

    async fn schema_exists(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
    ) -> Result<bool, BackendError> {
        let result = self
            .run(
                &format!("SHOW SCHEMAS LIKE '{}' IN ACCOUNT", id.schema),
                token,
            )
            .await?;
        Ok(any_row_matches(
            &result,
            &[
                ("name", id.schema.normalized()),
                ("database_name", id.database.normalized()),
            ],
        ))
    }

    async fn stage_exists(
        &self,
        id: &ResourceSetId,
        stage: &SqlIdentifier,
        token: &BearerToken,
    ) -> Result<bool, BackendError> {
        let result = self
            .run(&format!("SHOW STAGES LIKE '{stage}' IN ACCOUNT"), token)
            .await?;
        Ok(any_row_matches(
            &result,
            &[
                ("name", stage.normalized()),
                ("database_name", id.database.normalized()),
                ("schema_name", id.schema.normalized()),
            ],
        ))
    }

    async fn artifact_exists(
        &self,
        model: &SemanticModelRef,
        token: &BearerToken,
    ) -> Result<bool, BackendError> {
        if !self
            .stage_exists(&model.resource_set, &model.stage, token)
            .await?
        {
            return Ok(false);
        }
        let result = self.run(&format!("LIST {model}"), token).await?;
        let Some(name) = column_index(&result, "name") else {
            return Ok(false);
        };
        Ok(result.rows.iter().any(|row| {
            row.get(name)
                .and_then(Option::as_deref)
                .and_then(|path| path.rsplit('/').next())
                .is_some_and(|file| file == model.file)
        }))
    }
}

fn column_index(result: &ResultSet, name: &str) -> Option<usize> {
    result
        .columns
        .iter()
        .position(|column| column.eq_ignore_ascii_case(name))
}

/// Whether any row has every `(column, value)` pair, comparing case-insensitively.
fn any_row_matches(result: &ResultSet, expected: &[(&str, String)]) -> bool {
    let Some(indexes) = expected
        .iter()
        .map(|(column, value)| column_index(result, column).map(|i| (i, value)))
        .collect::<Option<Vec<_>>>()
    else {
        return false;
    };

    result.rows.iter().any(|row| {
        indexes.iter().all(|(i, value)| {
            row.get(*i)
                .and_then(Option::as_deref)
                .is_some_and(|cell| cell.eq_ignore_ascii_case(value))
        })
    })
}

fn create_database_statement(id: &ResourceSetId) -> String {
    format!(
        "CREATE DATABASE IF NOT EXISTS {} COMMENT = '{CREATED_BY}'",
        id.database
    )
}

fn create_schema_statement(id: &ResourceSetId) -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {} COMMENT = '{CREATED_BY}'",
        id.qualified()
    )
}

fn create_stage_statement(id: &ResourceSetId, stage: &SqlIdentifier) -> String {
    format!(
        "CREATE STAGE IF NOT EXISTS {}.{stage} \
         ENCRYPTION = (TYPE = 'SNOWFLAKE_SSE') \
         DIRECTORY = (ENABLE = TRUE) \
         COMMENT = '{CREATED_BY}'",
        id.qualified()
    )
}

/// `COPY INTO` statement writing `contents` verbatim as a single stage file.
fn upload_statement(model: &SemanticModelRef, contents: &str) -> Result<String, BackendError> {
    if contents.contains("$$") {
        return Err(BackendError::failed(
            "semantic model must not contain `$$`",
        ));
    }
    Ok(format!(
        "COPY INTO {model} FROM (SELECT $${contents}$$) \
         FILE_FORMAT = (TYPE = CSV COMPRESSION = NONE FIELD_DELIMITER = NONE \
         FIELD_OPTIONALLY_ENCLOSED_BY = NONE ESCAPE_UNENCLOSED_FIELD = NONE) \
         SINGLE = TRUE OVERWRITE = TRUE HEADER = FALSE"
    ))
}

#[async_trait]
impl ProvisioningBackend for SnowflakeProvisioningBackend {
    #[instrument(skip(self, token), fields(resource = %resource))]
    async fn exists(
        &self,
        resource: &ResourceRef,
        token: &BearerToken,
    ) -> Result<bool, BackendError> {
        match resource {
            ResourceRef::Namespace(id) => self.schema_exists(id, token).await,
            ResourceRef::StorageLocation {
                resource_set,
                stage,
            } => self.stage_exists(resource_set, stage, token).await,
            ResourceRef::SemanticArtifact(model) => self.artifact_exists(model, token).await,
        }
    }

    #[instrument(skip(self, token), fields(resource_set = %id))]
    async fn create_namespace(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
    ) -> Result<(), BackendError> {
        self.run(&create_database_statement(id), token).await?;
        self.run(&create_schema_statement(id), token).await?;
        Ok(())
    }

    #[instrument(skip(self, token), fields(resource_set = %id))]
    async fn create_storage_location(
        &self,
        id: &ResourceSetId,
        stage: &SqlIdentifier,
        token: &BearerToken,
    ) -> Result<(), BackendError> {
        self.run(&create_stage_statement(id, stage), token).await?;
        Ok(())
    }

    #[instrument(skip(self, contents, token), fields(model = %model))]
    async fn upload_artifact(
        &self,
        model: &SemanticModelRef,
        contents: &str,
        token: &BearerToken,
    ) -> Result<(), BackendError> {
        self.run(&upload_statement(model, contents)?, token).await?;
        Ok(())
    }

    #[instrument(skip(self, token), fields(resource = %resource))]
    async fn delete(&self, resource: &ResourceRef, token: &BearerToken) -> Result<(), BackendError> {
        match resource {
            // Dropping the database drops the schema, stage and file with it
            ResourceRef::Namespace(id) => {
                self.run(&format!("DROP DATABASE IF EXISTS {}", id.database), token)
                    .await?;
            }
            ResourceRef::StorageLocation {
                resource_set,
                stage,
            } => {
                if self.stage_exists(resource_set, stage, token).await? {
                    self.run(
                        &format!("DROP STAGE IF EXISTS {}.{stage}", resource_set.qualified()),
                        token,
                    )
                    .await?;
                }
            }
            ResourceRef::SemanticArtifact(model) => {
                if self.artifact_exists(model, token).await? {
                    self.run(&format!("REMOVE {model}"), token).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn id() -> ResourceSetId {
        ResourceSetId::default()
    }

    fn model() -> SemanticModelRef {
        SemanticModelRef {
            resource_set: id(),
            stage: SqlIdentifier::parse("semantic_models").unwrap(),
            file: "support_tickets_semantic_model.yaml".to_string(),
        }
    }

    fn cell(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[test]
    fn test_ddl_statements() {
        assert_eq!(
            create_database_statement(&id()),
            "CREATE DATABASE IF NOT EXISTS demo_db COMMENT = 'created by slack bot setup'"
        );
        assert_eq!(
            create_schema_statement(&id()),
            "CREATE SCHEMA IF NOT EXISTS demo_db.data COMMENT = 'created by slack bot setup'"
        );
        let stage = create_stage_statement(&id(), &model().stage);
        assert!(stage.starts_with("CREATE STAGE IF NOT EXISTS demo_db.data.semantic_models "));
        assert!(stage.contains("ENCRYPTION = (TYPE = 'SNOWFLAKE_SSE')"));
        assert!(stage.contains("DIRECTORY = (ENABLE = TRUE)"));
    }

    #[test]
    fn test_upload_statement() {
        let statement = upload_statement(&model(), "name: x\n").unwrap();
        assert!(statement.starts_with(
            "COPY INTO @demo_db.data.semantic_models/support_tickets_semantic_model.yaml FROM (SELECT $$name: x\n$$)"
        ));
        assert!(statement.contains("SINGLE = TRUE OVERWRITE = TRUE"));
    }

    #[test]
    fn test_upload_rejects_dollar_quotes() {
        assert!(upload_statement(&model(), "sql: $$ drop $$").is_err());
    }

    #[test]
    fn test_any_row_matches_filters_on_every_column() {
        let result = ResultSet {
            columns: vec![
                "created_on".to_string(),
                "name".to_string(),
                "database_name".to_string(),
            ],
            rows: vec![
                vec![cell("2024-01-01"), cell("DATA"), cell("OTHER_DB")],
                vec![cell("2024-01-01"), cell("DATA"), cell("DEMO_DB")],
            ],
            total_rows: 2,
            statement_handle: None,
        };
        assert!(any_row_matches(
            &result,
            &[
                ("name", "DATA".to_string()),
                ("database_name", "demo_db".to_string())
            ]
        ));
        assert!(!any_row_matches(
            &result,
            &[
                ("name", "DATA".to_string()),
                ("database_name", "MISSING".to_string())
            ]
        ));
        assert!(!any_row_matches(
            &result,
            &[("schema_name", "DATA".to_string())]
        ));
    }
}
