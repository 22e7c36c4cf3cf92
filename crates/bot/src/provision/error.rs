//! Provisioning errors.

use std::time::Duration;

use demo_mate_core::{IdentifierError, ResourceSetId, ResourceStatus};
use thiserror::Error;

use super::resource::{ProvisionStep, ResourceRef};
use crate::backend::BackendError;

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepError {
    /// The backend rejected or failed the call.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The step exceeded its time budget.
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The semantic model could not be produced.
    #[error("{0}")]
    Artifact(String),
}

/// Errors returned by the resource provisioner.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Another provisioning or teardown is running for the same set.
    #[error("{id} is already {status}")]
    Conflict {
        /// Resource set.
        id: ResourceSetId,
        /// Operation in flight.
        status: ResourceStatus,
    },

    /// A step failed; earlier steps were left in place.
    #[error("{failed_step} step failed after completing [{}]: {cause}", format_steps(.completed_steps))]
    PartialFailure {
        /// Steps that completed before the failure.
        completed_steps: Vec<ProvisionStep>,
        /// The step that failed.
        failed_step: ProvisionStep,
        /// Underlying failure.
        #[source]
        cause: StepError,
    },

    /// Teardown finished but some objects still exist.
    #[error("teardown of {id} left {} object(s): {}{}", .remaining.len(), format_resources(.remaining), format_detail(.detail.as_deref()))]
    TeardownIncomplete {
        /// Resource set.
        id: ResourceSetId,
        /// Objects that could not be removed.
        remaining: Vec<ResourceRef>,
        /// First deletion failure, if one was reported.
        detail: Option<String>,
    },

    /// The database or schema name is invalid.
    #[error("invalid resource set: {0}")]
    InvalidResourceSet(#[from] IdentifierError),

    /// The status probe could not reach the backend.
    #[error("could not determine status of {id}: {cause}")]
    StatusUnavailable {
        /// Resource set.
        id: ResourceSetId,
        /// Underlying failure.
        #[source]
        cause: StepError,
    },
}

fn format_steps(steps: &[ProvisionStep]) -> String {
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_resources(resources: &[ResourceRef]) -> String {
    resources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_detail(detail: Option<&str>) -> String {
    detail.map_or_else(String::new, |d| format!(" ({d})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_display() {
        let err = ProvisionError::PartialFailure {
            completed_steps: vec![ProvisionStep::Namespace],
            failed_step: ProvisionStep::StorageLocation,
            cause: StepError::Backend(BackendError::failed("insufficient privileges")),
        };
        assert_eq!(
            err.to_string(),
            "storage location step failed after completing [namespace]: insufficient privileges"
        );
    }

    #[test]
    fn test_conflict_display() {
        let err = ProvisionError::Conflict {
            id: ResourceSetId::default(),
            status: ResourceStatus::TearingDown,
        };
        assert_eq!(err.to_string(), "demo_db.data is already tearing down");
    }

    #[test]
    fn test_teardown_incomplete_display() {
        let err = ProvisionError::TeardownIncomplete {
            id: ResourceSetId::default(),
            remaining: vec![ResourceRef::Namespace(ResourceSetId::default())],
            detail: Some("namespace: timed out after 60s".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "teardown of demo_db.data left 1 object(s): schema demo_db.data (namespace: timed out after 60s)"
        );
    }
}
