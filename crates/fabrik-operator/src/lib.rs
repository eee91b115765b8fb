//! Fabrik reconciliation engine
//!
//! Watch-driven workers over Fabrik resources:
//!
//! - [`poller::ReconciliationPoller`] follows long-running operations until they finish
//! - [`operator::ResourceOperator`] turns requests into service calls
//! - [`reaper::StaleLockReaper`] releases deployment locks left behind by finished operations
//!
//! Every worker claims resources through [`lock`] before acting, so any
//! number of processes may run side by side.

#![deny(missing_docs)]

/// Deployment operator service and director task polling
pub mod deployment;
/// Deployment lock errors
pub mod error;
/// Annotation locks and deployment lock records
pub mod lock;
/// Request operator and service registry
pub mod operator;
/// Generic reconciliation poller
pub mod poller;
/// Stale deployment lock cleanup
pub mod reaper;
/// Watch consumer loop
pub mod watch;

pub use error::LockError;
pub use lock::{DeploymentLocks, LockManager};
pub use operator::{OperatorRegistry, OperatorService, ResourceOperator, ServiceOutcome};
pub use poller::{PollStatus, ReconciliationPoller, StatusSource};
pub use reaper::StaleLockReaper;
