//! Errors raised by the deployment lock API

use thiserror::Error;

/// Deployment lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Deployment is locked by another operation
    #[error("deployment {resource} is locked by operation '{operation}'")]
    Locked {
        /// Operation holding the lock
        operation: String,
        /// Instance id of the locked deployment
        resource: String,
    },

    /// Store failure while reading or writing the lock record
    #[error(transparent)]
    Store(#[from] fabrik_common::Error),
}

impl LockError {
    /// Returns true if the deployment is held by someone else
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}
