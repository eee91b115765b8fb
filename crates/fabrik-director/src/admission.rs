//! Admission control for director deployments
//!
//! [`AdmissionController::execute_policy`] never fails: when the director
//! cannot be asked for its policy or task counts, the operation is deferred
//! rather than risk overloading it. A director without a policy admits
//! everything.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fabrik_common::{Error, Result};

use crate::client::DirectorClient;
use crate::policy::{Category, OperationType};

/// Operation asking for director capacity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Initiated by the scheduler rather than a user
    pub scheduled: bool,
    /// Operation type
    pub operation: OperationType,
    /// Deployment name
    pub deployment: String,
    /// Skip admission control (the caller already holds a slot)
    pub run_immediately: bool,
}

impl AdmissionRequest {
    /// Request for a user-initiated operation
    pub fn user(operation: OperationType, deployment: impl Into<String>) -> Self {
        Self {
            scheduled: false,
            operation,
            deployment: deployment.into(),
            run_immediately: false,
        }
    }

    /// Request for a scheduled operation
    pub fn scheduled(operation: OperationType, deployment: impl Into<String>) -> Self {
        Self {
            scheduled: true,
            ..Self::user(operation, deployment)
        }
    }

    /// Bypass admission control
    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    /// Category of the request
    pub fn category(&self) -> Category {
        Category::of(self.scheduled)
    }

    /// Context id the dispatched task is tagged with
    pub fn context_id(&self) -> String {
        if self.scheduled {
            crate::policy::SCHEDULED_CONTEXT_ID.to_string()
        } else {
            self.operation.context_id()
        }
    }
}

/// Why an operation was deferred
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferReason {
    /// Director policy or task counts could not be fetched
    DirectorUnavailable,
    /// Every director worker is busy
    TotalCapacity {
        /// Tasks in flight
        current: u32,
        /// Director ceiling
        limit: u32,
    },
    /// The request's category is at its ceiling
    CategoryCapacity {
        /// Category that is full
        category: Category,
        /// Tasks in flight in the category
        current: u32,
        /// Category ceiling
        limit: u32,
    },
    /// The operation type is at its ceiling
    OperationCapacity {
        /// Operation type that is full
        operation: OperationType,
        /// Tasks in flight of this type
        current: u32,
        /// Operation ceiling
        limit: u32,
    },
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectorUnavailable => write!(f, "director unavailable"),
            Self::TotalCapacity { current, limit } => {
                write!(f, "director at capacity: {current}/{limit}")
            }
            Self::CategoryCapacity {
                category,
                current,
                limit,
            } => write!(f, "{category} operations at capacity: {current}/{limit}"),
            Self::OperationCapacity {
                operation,
                current,
                limit,
            } => write!(f, "{operation} operations at capacity: {current}/{limit}"),
        }
    }
}

/// Result of an admission check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Dispatch now
    RunNow,
    /// Do not dispatch yet
    Defer(DeferReason),
}

impl AdmissionDecision {
    /// Returns true if the operation may be dispatched now
    pub fn should_run_now(&self) -> bool {
        matches!(self, Self::RunNow)
    }
}

/// Outcome of a gated deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentResponse {
    /// Director task id; `None` when the operation was accepted but deferred
    pub task_id: Option<String>,
}

impl DeploymentResponse {
    /// Returns true if the operation was accepted but not dispatched
    pub fn is_deferred(&self) -> bool {
        self.task_id.is_none()
    }
}

/// Gates deployments on director capacity
pub struct AdmissionController {
    director: Arc<dyn DirectorClient>,
    rate_limit_enabled: bool,
}

impl AdmissionController {
    /// Create a controller; with `rate_limit_enabled` false every deployment
    /// is dispatched directly
    pub fn new(director: Arc<dyn DirectorClient>, rate_limit_enabled: bool) -> Self {
        Self {
            director,
            rate_limit_enabled,
        }
    }

    /// Decide whether an operation may run now
    pub async fn execute_policy(&self, request: &AdmissionRequest) -> AdmissionDecision {
        let director = match self
            .director
            .get_director_for_operation(request.operation, &request.deployment)
            .await
        {
            Ok(Some(director)) => director,
            Ok(None) => {
                warn!(
                    deployment = %request.deployment,
                    operation = %request.operation,
                    "No director configured for operation, deferring"
                );
                return AdmissionDecision::Defer(DeferReason::DirectorUnavailable);
            }
            Err(e) => {
                warn!(
                    deployment = %request.deployment,
                    error = %e,
                    "Failed to resolve director, deferring"
                );
                return AdmissionDecision::Defer(DeferReason::DirectorUnavailable);
            }
        };

        let Some(policy) = director.policy.as_ref() else {
            debug!(director = %director.name, "No worker policy configured, admitting");
            return AdmissionDecision::RunNow;
        };

        let counts = match self.director.get_current_tasks(&director).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(
                    director = %director.name,
                    error = %e,
                    "Failed to fetch current director tasks, deferring"
                );
                return AdmissionDecision::Defer(DeferReason::DirectorUnavailable);
            }
        };

        if let Some(limit) = policy.max_workers {
            if counts.total >= limit {
                return AdmissionDecision::Defer(DeferReason::TotalCapacity {
                    current: counts.total,
                    limit,
                });
            }
        }

        let category = request.category();
        let Some(category_policy) = policy.category(category) else {
            return AdmissionDecision::RunNow;
        };

        if let Some(limit) = category_policy.max_workers {
            let current = counts.for_category(category);
            if current >= limit {
                return AdmissionDecision::Defer(DeferReason::CategoryCapacity {
                    category,
                    current,
                    limit,
                });
            }
        }

        if category == Category::User {
            if let Some(limit) = category_policy.limit_for(request.operation) {
                let current = counts.for_operation(request.operation);
                if current >= limit {
                    return AdmissionDecision::Defer(DeferReason::OperationCapacity {
                        operation: request.operation,
                        current,
                        limit,
                    });
                }
            }
        }

        AdmissionDecision::RunNow
    }

    /// Dispatch a deployment if the director has capacity
    ///
    /// Deferred user operations return a response without a task id; the
    /// caller keeps the resource queued. Deferred scheduled operations fail
    /// with [`Error::DeploymentAttemptRejected`] so the scheduler can retry
    /// on its own cadence.
    pub async fn create_or_update_deployment(
        &self,
        request: &AdmissionRequest,
        manifest: &serde_json::Value,
    ) -> Result<DeploymentResponse> {
        if self.rate_limit_enabled && !request.run_immediately {
            if let AdmissionDecision::Defer(reason) = self.execute_policy(request).await {
                info!(
                    deployment = %request.deployment,
                    operation = %request.operation,
                    scheduled = request.scheduled,
                    reason = %reason,
                    "Deployment deferred"
                );
                if request.scheduled {
                    return Err(Error::DeploymentAttemptRejected {
                        deployment: request.deployment.clone(),
                    });
                }
                return Ok(DeploymentResponse { task_id: None });
            }
        }

        let task_id = self
            .director
            .create_or_update_deployment(&request.deployment, manifest, &request.context_id())
            .await?;
        info!(
            deployment = %request.deployment,
            operation = %request.operation,
            task_id = %task_id,
            "Deployment dispatched"
        );
        Ok(DeploymentResponse {
            task_id: Some(task_id),
        })
    }
}
