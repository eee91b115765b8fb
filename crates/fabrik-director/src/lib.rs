//! Director capacity and admission control
//!
//! The deployment director runs a bounded worker pool. Before a deployment
//! is dispatched, [`admission::AdmissionController`] compares the director's
//! worker policy against its in-flight tasks and decides whether the
//! operation runs now or is deferred.
//!
//! # Modules
//!
//! - [`policy`] - Worker policy, operation types, in-flight task counts
//! - [`client`] - Director API trait
//! - [`admission`] - Admission decisions and gated dispatch

#![deny(missing_docs)]

pub mod admission;
pub mod client;
pub mod policy;

pub use admission::{
    AdmissionController, AdmissionDecision, AdmissionRequest, DeferReason, DeploymentResponse,
};
pub use client::{DirectorClient, TaskState};
pub use policy::{OperationType, TaskCounts};
