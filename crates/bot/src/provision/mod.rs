//! Create, verify and destroy the objects a conversation queries.
//!
//! A resource set is a database and schema holding one stage, which in turn
//! holds the semantic model file the analyst reads. [`ResourceProvisioner`]
//! walks the [`ProvisionStep`]s in order, probing each object and creating
//! it only when missing, so repeating a setup after a partial failure
//! resumes where the last attempt stopped.

mod error;
mod resource;

pub use error::{ProvisionError, StepError};
pub use resource::{
    ProvisionStep, ProvisionedResourceSet, ResourceRef, SemanticModelRef, render_semantic_model,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use demo_mate_core::{ResourceSetId, ResourceStatus, SqlIdentifier};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::backend::BackendError;
use crate::credential::BearerToken;

/// Backend that owns the provisioned objects.
///
/// Create operations must succeed when the object already exists, and
/// `delete` must succeed when it is already gone.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Whether the object exists.
    async fn exists(&self, resource: &ResourceRef, token: &BearerToken)
    -> Result<bool, BackendError>;

    /// Create the database and schema.
    async fn create_namespace(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
    ) -> Result<(), BackendError>;

    /// Create the stage.
    async fn create_storage_location(
        &self,
        id: &ResourceSetId,
        stage: &SqlIdentifier,
        token: &BearerToken,
    ) -> Result<(), BackendError>;

    /// Upload the semantic model file.
    async fn upload_artifact(
        &self,
        model: &SemanticModelRef,
        contents: &str,
        token: &BearerToken,
    ) -> Result<(), BackendError>;

    /// Remove the object.
    async fn delete(&self, resource: &ResourceRef, token: &BearerToken) -> Result<(), BackendError>;
}

/// A provisioning step that finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    /// Object the step is about.
    pub resource: ResourceRef,
    /// Whether the step created it, rather than finding it in place.
    pub created: bool,
}

// =============================================================================
// ResourceProvisioner
// =============================================================================

/// Provisions resource sets and tracks their in-flight status.
#[derive(Clone)]
pub struct ResourceProvisioner {
    inner: Arc<ResourceProvisionerInner>,
}

struct ResourceProvisionerInner {
    backend: Arc<dyn ProvisioningBackend>,
    stage: SqlIdentifier,
    model_file: String,
    step_timeout: Duration,
    statuses: Mutex<HashMap<ResourceSetId, ResourceStatus>>,
}

impl std::fmt::Debug for ResourceProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceProvisioner")
            .field("stage", &self.inner.stage)
            .field("model_file", &self.inner.model_file)
            .field("step_timeout", &self.inner.step_timeout)
            .finish_non_exhaustive()
    }
}

/// Marks a set as in flight until finished; a dropped guard marks it Failed.
struct InFlight<'a> {
    provisioner: &'a ResourceProvisionerInner,
    id: ResourceSetId,
    done: bool,
}

impl InFlight<'_> {
    fn finish(mut self, status: ResourceStatus) {
        self.provisioner.set_status(&self.id, status);
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.provisioner.set_status(&self.id, ResourceStatus::Failed);
        }
    }
}

impl ResourceProvisionerInner {
    fn set_status(&self, id: &ResourceSetId, status: ResourceStatus) {
        let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
        if status == ResourceStatus::Absent {
            statuses.remove(id);
        } else {
            statuses.insert(id.clone(), status);
        }
    }
}

impl ResourceProvisioner {
    /// Create a provisioner placing the semantic model at `stage`/`model_file`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        stage: SqlIdentifier,
        model_file: impl Into<String>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceProvisionerInner {
                backend,
                stage,
                model_file: model_file.into(),
                step_timeout,
                statuses: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Parse a resource set from user-supplied names.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidResourceSet`] for invalid identifiers.
    pub fn resource_set(database: &str, schema: &str) -> Result<ResourceSetId, ProvisionError> {
        Ok(ResourceSetId::parse(database, schema)?)
    }

    /// Where the semantic model of `id` lives.
    #[must_use]
    pub fn semantic_model(&self, id: &ResourceSetId) -> SemanticModelRef {
        SemanticModelRef {
            resource_set: id.clone(),
            stage: self.inner.stage.clone(),
            file: self.inner.model_file.clone(),
        }
    }

    /// Objects of `id`, in creation order.
    #[must_use]
    pub fn resources(&self, id: &ResourceSetId) -> Vec<ResourceRef> {
        vec![
            ResourceRef::Namespace(id.clone()),
            ResourceRef::StorageLocation {
                resource_set: id.clone(),
                stage: self.inner.stage.clone(),
            },
            ResourceRef::SemanticArtifact(self.semantic_model(id)),
        ]
    }

    /// Create whatever is missing of `id`.
    ///
    /// Objects that already exist are left alone, so provisioning a Ready set
    /// only verifies it. On failure the objects created so far stay in place
    /// and the set is marked Failed.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Conflict`] if the set is being provisioned or
    /// torn down, or [`ProvisionError::PartialFailure`] naming the failed step.
    pub async fn provision(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
    ) -> Result<ProvisionedResourceSet, ProvisionError> {
        self.provision_reporting(id, token, None).await
    }

    /// [`Self::provision`], sending a [`StepProgress`] to `progress` as each
    /// step finishes.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::provision`].
    #[instrument(skip(self, token, progress), fields(resource_set = %id))]
    pub async fn provision_reporting(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
        progress: Option<&UnboundedSender<StepProgress>>,
    ) -> Result<ProvisionedResourceSet, ProvisionError> {
        let guard = self.begin(id, ResourceStatus::Provisioning)?;
        let resources = self.resources(id);
        let mut completed_steps = Vec::with_capacity(resources.len());

        for resource in &resources {
            let step = resource.step();
            let created = match self.ensure(resource, token).await {
                Ok(true) => {
                    info!(%step, %resource, "Created");
                    true
                }
                Ok(false) => {
                    debug!(%step, %resource, "Already present");
                    false
                }
                Err(cause) => {
                    warn!(%step, error = %cause, "Provisioning step failed");
                    guard.finish(ResourceStatus::Failed);
                    return Err(ProvisionError::PartialFailure {
                        completed_steps,
                        failed_step: step,
                        cause,
                    });
                }
            };
            completed_steps.push(step);
            if let Some(progress) = progress {
                let sent = progress.send(StepProgress {
                    resource: resource.clone(),
                    created,
                });
                if sent.is_err() {
                    debug!(%step, "Progress receiver gone");
                }
            }
        }

        guard.finish(ResourceStatus::Ready);
        info!("Resource set ready");
        Ok(ProvisionedResourceSet {
            id: id.clone(),
            resources,
            status: ResourceStatus::Ready,
        })
    }

    /// Delete every object of `id`, newest first.
    ///
    /// Deletion continues past individual failures; afterwards every object
    /// is probed again.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Conflict`] if the set is busy, or
    /// [`ProvisionError::TeardownIncomplete`] listing objects that remain.
    #[instrument(skip(self, token), fields(resource_set = %id))]
    pub async fn teardown(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
    ) -> Result<ProvisionedResourceSet, ProvisionError> {
        let guard = self.begin(id, ResourceStatus::TearingDown)?;
        let resources = self.resources(id);
        let mut detail = None;

        for resource in resources.iter().rev() {
            let result = self
                .bounded(self.inner.backend.delete(resource, token))
                .await;
            if let Err(e) = result {
                warn!(%resource, error = %e, "Delete failed, continuing");
                detail.get_or_insert_with(|| format!("{}: {e}", resource.step()));
            }
        }

        let mut remaining = Vec::new();
        for resource in resources {
            match self
                .bounded(self.inner.backend.exists(&resource, token))
                .await
            {
                Ok(false) => {}
                Ok(true) => remaining.push(resource),
                Err(e) => {
                    detail.get_or_insert_with(|| format!("{}: {e}", resource.step()));
                    remaining.push(resource);
                }
            }
        }

        if !remaining.is_empty() {
            guard.finish(ResourceStatus::Failed);
            return Err(ProvisionError::TeardownIncomplete {
                id: id.clone(),
                remaining,
                detail,
            });
        }

        guard.finish(ResourceStatus::Absent);
        info!("Resource set removed");
        Ok(ProvisionedResourceSet {
            id: id.clone(),
            resources: Vec::new(),
            status: ResourceStatus::Absent,
        })
    }

    /// Report the status of `id` without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::StatusUnavailable`] if a probe fails.
    #[instrument(skip(self, token), fields(resource_set = %id))]
    pub async fn status(
        &self,
        id: &ResourceSetId,
        token: &BearerToken,
    ) -> Result<ResourceStatus, ProvisionError> {
        if let Some(status) = self.tracked_status(id)
            && status.is_in_flight()
        {
            return Ok(status);
        }

        let resources = self.resources(id);
        let mut present = 0;
        for resource in &resources {
            let exists = self
                .bounded(self.inner.backend.exists(resource, token))
                .await
                .map_err(|cause| ProvisionError::StatusUnavailable {
                    id: id.clone(),
                    cause,
                })?;
            if exists {
                present += 1;
            }
        }

        Ok(match present {
            0 => ResourceStatus::Absent,
            n if n == resources.len() => ResourceStatus::Ready,
            _ => ResourceStatus::Failed,
        })
    }

    /// Last status recorded for `id` by this process.
    #[must_use]
    pub fn tracked_status(&self, id: &ResourceSetId) -> Option<ResourceStatus> {
        self.inner
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    fn begin(
        &self,
        id: &ResourceSetId,
        status: ResourceStatus,
    ) -> Result<InFlight<'_>, ProvisionError> {
        let mut statuses = self
            .inner
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = statuses.get(id)
            && current.is_in_flight()
        {
            return Err(ProvisionError::Conflict {
                id: id.clone(),
                status: *current,
            });
        }
        statuses.insert(id.clone(), status);
        Ok(InFlight {
            provisioner: &self.inner,
            id: id.clone(),
            done: false,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, StepError> {
        match tokio::time::timeout(self.inner.step_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StepError::Timeout(self.inner.step_timeout)),
        }
    }

    /// Probe, then create if missing. Returns whether anything was created.
    async fn ensure(&self, resource: &ResourceRef, token: &BearerToken) -> Result<bool, StepError> {
        let backend = &self.inner.backend;
        if self.bounded(backend.exists(resource, token)).await? {
            return Ok(false);
        }

        match resource {
            ResourceRef::Namespace(id) => {
                self.bounded(backend.create_namespace(id, token)).await?;
            }
            ResourceRef::StorageLocation {
                resource_set,
                stage,
            } => {
                self.bounded(backend.create_storage_location(resource_set, stage, token))
                    .await?;
            }
            ResourceRef::SemanticArtifact(model) => {
                let yaml =
                    render_semantic_model(&model.resource_set).map_err(StepError::Artifact)?;
                self.bounded(backend.upload_artifact(model, &yaml, token))
                    .await?;
            }
        }
        Ok(true)
    }
}
