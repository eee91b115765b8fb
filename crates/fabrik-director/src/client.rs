//! Director API
//!
//! The wire protocol of the deployment director is not part of this crate;
//! callers plug in an implementation of [`DirectorClient`].

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use fabrik_common::resource::ResourceState;
use fabrik_common::Result;

use crate::policy::{DirectorConfig, OperationType, TaskCounts};

/// State of a director task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a worker
    Queued,
    /// Running
    Processing,
    /// Cancellation requested
    Cancelling,
    /// Finished successfully
    Done,
    /// Finished with an error
    Error,
    /// Cancelled
    Cancelled,
    /// Timed out
    Timeout,
}

impl TaskState {
    /// Resource state a task maps to once it finished; `None` while it runs
    pub fn terminal_state(&self) -> Option<ResourceState> {
        match self {
            Self::Queued | Self::Processing | Self::Cancelling => None,
            Self::Done => Some(ResourceState::Succeeded),
            Self::Error | Self::Timeout => Some(ResourceState::Failed),
            Self::Cancelled => Some(ResourceState::Aborted),
        }
    }
}

/// Deployment director operations Fabrik depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DirectorClient: Send + Sync {
    /// Director responsible for an operation on a deployment, `None` if no
    /// director is configured for it
    async fn get_director_for_operation(
        &self,
        operation: OperationType,
        deployment: &str,
    ) -> Result<Option<DirectorConfig>>;

    /// Tasks currently running on a director, grouped by origin
    async fn get_current_tasks(&self, director: &DirectorConfig) -> Result<TaskCounts>;

    /// Start a deployment task tagged with `context_id`; returns the task id
    async fn create_or_update_deployment(
        &self,
        deployment: &str,
        manifest: &serde_json::Value,
        context_id: &str,
    ) -> Result<String>;

    /// Start a task deleting a deployment; returns the task id
    async fn delete_deployment(&self, deployment: &str, context_id: &str) -> Result<String>;

    /// Current state of a task
    async fn get_task_state(&self, task_id: &str) -> Result<TaskState>;
}
