//! Deployment operator glue
//!
//! [`DeploymentService`] turns `deployment/<type>` requests into director
//! tasks through the admission controller. The task id lands in
//! `status.response`, the resource moves to `in_progress`, and a
//! [`ReconciliationPoller`] driven by [`DeploymentTaskStatus`] follows the
//! task until it finishes and writes the final state back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fabrik_common::config::FabrikConfig;
use fabrik_common::resource::{
    Resource, ResourceKey, ResourceKind, ResourcePatch, ResourceState, ResourceStatus, StateQuery,
};
use fabrik_common::store::{CasResult, ResourceStore};
use fabrik_common::{Error, Result};
use fabrik_director::{AdmissionController, AdmissionRequest, DirectorClient, OperationType};

use crate::lock::POLLER_LOCK_ANNOTATION;
use crate::operator::{OperatorService, ServiceOutcome};
use crate::poller::{PollStatus, PollerConfig, ReconciliationPoller, StatusSource};

/// Deployment request carried in a resource spec
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Director deployment name
    pub deployment_name: String,
    /// Rendered manifest
    #[serde(default)]
    pub manifest: serde_json::Value,
    /// Started by the scheduler rather than a user
    #[serde(default)]
    pub scheduled: bool,
    /// Skip admission control
    #[serde(default, rename = "_runImmediately")]
    pub run_immediately: bool,
}

/// Response written to `status.response` while a task runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Director task id
    pub task_id: String,
    /// Operation the task performs
    pub operation: OperationType,
    /// Director deployment name
    pub deployment_name: String,
}

/// [`OperatorService`] dispatching deployments to the director
pub struct DeploymentService {
    admission: Arc<AdmissionController>,
    director: Arc<dyn DirectorClient>,
}

impl DeploymentService {
    /// Create the service
    pub fn new(admission: Arc<AdmissionController>, director: Arc<dyn DirectorClient>) -> Self {
        Self {
            admission,
            director,
        }
    }

    async fn deploy(&self, operation: OperationType, resource: &Resource) -> Result<ServiceOutcome> {
        let spec: DeploymentSpec = resource.spec_as()?;
        let request = AdmissionRequest {
            scheduled: spec.scheduled,
            operation,
            deployment: spec.deployment_name.clone(),
            run_immediately: spec.run_immediately,
        };

        // A rejected scheduled attempt is an error, so the run is recorded as
        // failed rather than replayed
        let response = self
            .admission
            .create_or_update_deployment(&request, &spec.manifest)
            .await?;
        match response.task_id {
            Some(task_id) => in_progress(task_id, operation, spec.deployment_name),
            None => {
                debug!(deployment = %spec.deployment_name, "User deployment deferred");
                Ok(ServiceOutcome::Deferred)
            }
        }
    }
}

fn in_progress(
    task_id: String,
    operation: OperationType,
    deployment_name: String,
) -> Result<ServiceOutcome> {
    let response = TaskResponse {
        task_id,
        operation,
        deployment_name,
    };
    Ok(ServiceOutcome::InProgress(serde_json::to_value(response)?))
}

#[async_trait]
impl OperatorService for DeploymentService {
    async fn create(&self, resource: &Resource) -> Result<ServiceOutcome> {
        self.deploy(OperationType::Create, resource).await
    }

    async fn update(&self, resource: &Resource) -> Result<ServiceOutcome> {
        self.deploy(OperationType::Update, resource).await
    }

    async fn delete(&self, resource: &Resource) -> Result<ServiceOutcome> {
        let spec: DeploymentSpec = resource.spec_as()?;
        let task_id = self
            .director
            .delete_deployment(&spec.deployment_name, &OperationType::Delete.context_id())
            .await?;
        info!(deployment = %spec.deployment_name, task_id = %task_id, "Delete dispatched");
        in_progress(task_id, OperationType::Delete, spec.deployment_name)
    }
}

/// [`StatusSource`] following the director task in `status.response`
pub struct DeploymentTaskStatus {
    store: Arc<dyn ResourceStore>,
    director: Arc<dyn DirectorClient>,
}

impl DeploymentTaskStatus {
    /// Create the status source
    pub fn new(store: Arc<dyn ResourceStore>, director: Arc<dyn DirectorClient>) -> Self {
        Self { store, director }
    }

    /// Poller following in-progress resources of `kind`
    pub fn poller(
        store: Arc<dyn ResourceStore>,
        director: Arc<dyn DirectorClient>,
        kind: ResourceKind,
        config: &FabrikConfig,
        identity: &str,
    ) -> ReconciliationPoller {
        let poller_config = PollerConfig::new(
            kind,
            StateQuery::In(vec![ResourceState::InProgress]),
            config.pollers.task_poll_interval(),
            config,
            identity,
        );
        let status = Arc::new(Self::new(store.clone(), director));
        ReconciliationPoller::new(store, status, poller_config)
    }
}

#[async_trait]
impl StatusSource for DeploymentTaskStatus {
    async fn poll_status(&self, key: &ResourceKey, resource: &Resource) -> Result<PollStatus> {
        let response = resource
            .status
            .response
            .clone()
            .ok_or_else(|| Error::internal_with_context("task poller", format!("{key} has no task")))?;
        let task: TaskResponse = serde_json::from_value(response.clone())?;

        let task_state = self.director.get_task_state(&task.task_id).await?;
        let Some(state) = task_state.terminal_state() else {
            debug!(resource = %key, task_id = %task.task_id, state = ?task_state, "Task still running");
            return Ok(PollStatus::Pending);
        };

        let deleting = task.operation == OperationType::Delete;
        if deleting && state == ResourceState::Succeeded {
            self.store.delete(key).await?;
            info!(resource = %key, task_id = %task.task_id, "Deployment deleted");
            return Ok(PollStatus::Terminal);
        }

        let status = ResourceStatus {
            state: if deleting && state == ResourceState::Failed {
                ResourceState::DeleteFailed
            } else {
                state
            },
            error: (state != ResourceState::Succeeded).then(|| {
                serde_json::json!({
                    "code": "TaskFailed",
                    "message": format!("director task {} ended as {:?}", task.task_id, task_state),
                })
            }),
            response: Some(response),
        };
        let final_state = status.state;

        match self
            .store
            .patch(
                key,
                &ResourcePatch::new()
                    .with_status(status)
                    .remove_annotation(POLLER_LOCK_ANNOTATION),
                Some(resource.version()),
            )
            .await?
        {
            CasResult::Applied(_) => {
                info!(resource = %key, task_id = %task.task_id, state = %final_state, "Task finished");
                Ok(PollStatus::Terminal)
            }
            CasResult::Conflict { .. } => {
                debug!(resource = %key, "Resource changed while recording task outcome, retrying");
                Ok(PollStatus::Pending)
            }
            CasResult::NotFound => Ok(PollStatus::Terminal),
        }
    }
}
