//! Common types for Fabrik: resource model, store clients, errors, and utilities
//!
//! Every Fabrik component (pollers, operators, the stale-lock reaper) talks to
//! the resource store through the [`store::ResourceStore`] trait. Two
//! implementations ship here:
//!
//! - [`kube_store::KubeResourceStore`] - custom resources on a Kubernetes API server
//! - [`memory::InMemoryStore`] - process-local store with identical CAS semantics
//!
//! # Modules
//!
//! - [`resource`] - Resource, metadata, states, watch events, state queries
//! - [`store`] - Resource store trait and compare-and-swap outcome
//! - [`kube_store`] - Kubernetes-backed store
//! - [`memory`] - In-memory store
//! - [`config`] - Operator configuration
//! - [`retry`] - Retry with backoff
//! - [`error`] - Error taxonomy

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_store;
pub mod memory;
pub mod resource;
pub mod retry;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace all Fabrik resources live in
pub const FABRIK_NAMESPACE: &str = "default";

/// Domain suffix appended to resource groups (e.g. `deployment.servicefabrik.io`)
pub const API_GROUP_SUFFIX: &str = "servicefabrik.io";

/// API version served for every Fabrik resource group
pub const API_VERSION: &str = "v1alpha1";

/// Label carrying a resource's state, used for server-side state filtering
pub const STATE_LABEL_KEY: &str = "state";

/// Resource group holding deployment lock records
pub const LOCK_RESOURCE_GROUP: &str = "lock";

/// Resource type of deployment lock records
pub const DEPLOYMENT_LOCKS_TYPE: &str = "deploymentlocks";

/// Resource group holding deployment (instance) resources
pub const DEPLOYMENT_RESOURCE_GROUP: &str = "deployment";
