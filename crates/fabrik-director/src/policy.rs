//! Director worker policy and in-flight task counts
//!
//! A director advertises how many workers it will spend on Fabrik work:
//!
//! ```yaml
//! max_workers: 6
//! policies:
//!   scheduled:
//!     max_workers: 3
//!   user:
//!     update:
//!       max_workers: 3
//! ```
//!
//! Absent limits mean "no limit at this level". In-flight tasks are grouped
//! by the context id Fabrik stamps on every task it dispatches.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Context id stamped on scheduled (automatic) operations
pub const SCHEDULED_CONTEXT_ID: &str = "Fabrik::Operation::Auto";

/// Prefix of the context id stamped on user operations (`Fabrik::Operation::update`)
pub const USER_CONTEXT_PREFIX: &str = "Fabrik::Operation::";

/// Deployment operation requested by a user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create a deployment
    Create,
    /// Update a deployment
    Update,
    /// Delete a deployment
    Delete,
}

impl OperationType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Context id for a user-initiated operation of this type
    pub fn context_id(&self) -> String {
        format!("{USER_CONTEXT_PREFIX}{}", self.as_str())
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who initiated an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Interactive request from a user
    User,
    /// Scheduled job (backups, automatic updates)
    Scheduled,
}

impl Category {
    /// Category of a request
    pub fn of(scheduled: bool) -> Self {
        if scheduled {
            Self::Scheduled
        } else {
            Self::User
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Scheduled => f.write_str("scheduled"),
        }
    }
}

/// Worker ceiling at one level of the policy tree
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLimit {
    /// Maximum concurrent tasks; `None` means unlimited
    #[serde(default)]
    pub max_workers: Option<u32>,
}

/// Policy for one category (user or scheduled)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Ceiling for the whole category
    #[serde(default)]
    pub max_workers: Option<u32>,
    /// Ceiling for create operations (user category only)
    #[serde(default)]
    pub create: Option<WorkerLimit>,
    /// Ceiling for update operations (user category only)
    #[serde(default)]
    pub update: Option<WorkerLimit>,
    /// Ceiling for delete operations (user category only)
    #[serde(default)]
    pub delete: Option<WorkerLimit>,
}

impl CategoryPolicy {
    /// Ceiling configured for an operation type, if any
    pub fn limit_for(&self, operation: OperationType) -> Option<u32> {
        let limit = match operation {
            OperationType::Create => self.create.as_ref(),
            OperationType::Update => self.update.as_ref(),
            OperationType::Delete => self.delete.as_ref(),
        };
        limit.and_then(|l| l.max_workers)
    }
}

/// Per-category policies
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicies {
    /// Interactive operations
    #[serde(default)]
    pub user: Option<CategoryPolicy>,
    /// Scheduled operations
    #[serde(default)]
    pub scheduled: Option<CategoryPolicy>,
}

/// Worker policy of one director
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorPolicy {
    /// Ceiling across every Fabrik task on the director
    #[serde(default)]
    pub max_workers: Option<u32>,
    /// Category ceilings
    #[serde(default)]
    pub policies: CategoryPolicies,
}

impl DirectorPolicy {
    /// Sub-policy for a category
    pub fn category(&self, category: Category) -> Option<&CategoryPolicy> {
        match category {
            Category::User => self.policies.user.as_ref(),
            Category::Scheduled => self.policies.scheduled.as_ref(),
        }
    }
}

/// Director selected to run an operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorConfig {
    /// Director name
    pub name: String,
    /// Worker policy; `None` disables admission control for this director
    #[serde(default)]
    pub policy: Option<DirectorPolicy>,
}

/// A task currently running on the director
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorTask {
    /// Task id
    pub id: String,
    /// Deployment the task belongs to
    #[serde(default)]
    pub deployment: Option<String>,
    /// Context id the task was dispatched with
    #[serde(default)]
    pub context_id: Option<String>,
}

/// In-flight director tasks grouped by origin
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// User create operations
    pub create: u32,
    /// User update operations
    pub update: u32,
    /// User delete operations
    pub delete: u32,
    /// Scheduled operations
    pub scheduled: u32,
    /// Tasks not started by Fabrik (or without a context id)
    pub uncategorized: u32,
    /// Every in-flight task
    pub total: u32,
}

impl TaskCounts {
    /// Group tasks by their context id
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a DirectorTask>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.total += 1;
            let context = task.context_id.as_deref().unwrap_or_default();
            let slot = if context == SCHEDULED_CONTEXT_ID {
                &mut counts.scheduled
            } else {
                match context.strip_prefix(USER_CONTEXT_PREFIX) {
                    Some("create") => &mut counts.create,
                    Some("update") => &mut counts.update,
                    Some("delete") => &mut counts.delete,
                    _ => &mut counts.uncategorized,
                }
            };
            *slot += 1;
        }
        counts
    }

    /// In-flight user tasks of one operation type
    pub fn for_operation(&self, operation: OperationType) -> u32 {
        match operation {
            OperationType::Create => self.create,
            OperationType::Update => self.update,
            OperationType::Delete => self.delete,
        }
    }

    /// In-flight tasks of a category
    pub fn for_category(&self, category: Category) -> u32 {
        match category {
            Category::User => self.create + self.update + self.delete,
            Category::Scheduled => self.scheduled,
        }
    }
}
