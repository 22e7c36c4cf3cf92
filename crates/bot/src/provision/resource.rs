//! Resources making up a provisioned set, and the semantic model artifact.

use core::fmt;

use askama::Template;
use demo_mate_core::{ResourceSetId, ResourceStatus, SqlIdentifier};
use serde::Serialize;

/// Name of the table the semantic model describes.
const SUPPORT_TICKETS_TABLE: &str = "support_tickets";

/// One provisioning step, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    /// Database and schema.
    Namespace,
    /// Stage holding the semantic model.
    StorageLocation,
    /// The semantic model file on the stage.
    SemanticArtifact,
}

impl ProvisionStep {
    /// Every step, in creation order.
    pub const ALL: [Self; 3] = [Self::Namespace, Self::StorageLocation, Self::SemanticArtifact];
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Namespace => "namespace",
            Self::StorageLocation => "storage location",
            Self::SemanticArtifact => "semantic artifact",
        };
        f.write_str(label)
    }
}

/// Location of a staged semantic model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SemanticModelRef {
    /// Resource set holding the stage.
    pub resource_set: ResourceSetId,
    /// Stage name.
    pub stage: SqlIdentifier,
    /// File name on the stage.
    pub file: String,
}

impl SemanticModelRef {
    /// Stage path without the file, `@db.schema.stage`.
    #[must_use]
    pub fn stage_path(&self) -> String {
        format!("@{}.{}", self.resource_set.qualified(), self.stage)
    }
}

impl fmt::Display for SemanticModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage_path(), self.file)
    }
}

/// A backend object created by provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRef {
    /// Database and schema.
    Namespace(ResourceSetId),
    /// Stage inside the schema.
    StorageLocation {
        /// Owning resource set.
        resource_set: ResourceSetId,
        /// Stage name.
        stage: SqlIdentifier,
    },
    /// Semantic model file on the stage.
    SemanticArtifact(SemanticModelRef),
}

impl ResourceRef {
    /// The step that creates this resource.
    #[must_use]
    pub const fn step(&self) -> ProvisionStep {
        match self {
            Self::Namespace(_) => ProvisionStep::Namespace,
            Self::StorageLocation { .. } => ProvisionStep::StorageLocation,
            Self::SemanticArtifact(_) => ProvisionStep::SemanticArtifact,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(id) => write!(f, "schema {id}"),
            Self::StorageLocation {
                resource_set,
                stage,
            } => write!(f, "stage {resource_set}.{stage}"),
            Self::SemanticArtifact(model) => write!(f, "semantic model {model}"),
        }
    }
}

/// A resource set together with its objects and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedResourceSet {
    /// Database and schema.
    pub id: ResourceSetId,
    /// Objects that exist for the set.
    pub resources: Vec<ResourceRef>,
    /// Current status.
    pub status: ResourceStatus,
}

#[derive(Template)]
#[template(path = "snowflake/semantic_model.yaml", escape = "none")]
struct SemanticModelTemplate<'a> {
    database: &'a SqlIdentifier,
    schema: &'a SqlIdentifier,
    table: &'a str,
}

/// Render the semantic model YAML for a resource set.
///
/// The output is parsed back as YAML before it is returned.
///
/// # Errors
///
/// Returns a message if rendering fails or the result is not valid YAML.
pub fn render_semantic_model(resource_set: &ResourceSetId) -> Result<String, String> {
    let yaml = SemanticModelTemplate {
        database: &resource_set.database,
        schema: &resource_set.schema,
        table: SUPPORT_TICKETS_TABLE,
    }
    .render()
    .map_err(|e| format!("failed to render semantic model: {e}"))?;

    serde_yaml::from_str::<serde_yaml::Value>(&yaml)
        .map_err(|e| format!("rendered semantic model is not valid YAML: {e}"))?;

    Ok(yaml)
}
