//! Error types for Fabrik operations
//!
//! Conflicts and missing resources are ordinary outcomes of the
//! compare-and-swap protocol. Store calls report them through
//! [`crate::store::CasResult`]; the variants here exist for the places where
//! they have to travel as errors (e.g. acquiring a lock on a deleted resource).

use thiserror::Error;

/// Main error type for Fabrik operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Conditional write lost the race against another writer
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Resource that was being written (group/type/id)
        resource: String,
        /// What was being attempted
        message: String,
    },

    /// Resource does not exist (or vanished mid-operation)
    #[error("{resource} not found")]
    NotFound {
        /// Resource that was looked up (group/type/id)
        resource: String,
    },

    /// Store or director is unreachable; safe to retry later
    #[error("unavailable [{context}]: {message}")]
    Unavailable {
        /// Component that could not be reached (e.g. "store", "director")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Deployment director rejected or failed a request
    #[error("director error: {0}")]
    Director(String),

    /// A scheduled operation was refused for lack of director capacity
    #[error("deployment attempt rejected for {deployment}: no director capacity")]
    DeploymentAttemptRejected {
        /// Name of the deployment that was not dispatched
        deployment: String,
    },

    /// Operator service failed while processing a resource
    #[error("service error for {resource}: {message}")]
    Service {
        /// Resource being processed
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "poller", "watch", "store")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for a resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unavailable {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a director error with the given message
    pub fn director(msg: impl Into<String>) -> Self {
        Self::Director(msg.into())
    }

    /// Create a service error for a resource
    pub fn service(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Service {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: "unknown".to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if this error is a lost compare-and-swap race
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(e),
            } => e.code == 409,
            _ => false,
        }
    }

    /// True if the target resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(e),
            } => e.code == 404,
            _ => false,
        }
    }

    /// True if retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Kube { .. } | Self::Director(_) => {
                !self.is_not_found()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
