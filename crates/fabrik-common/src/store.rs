//! Resource store abstraction
//!
//! # CAS semantics
//!
//! [`ResourceStore::patch`] is the only way to mutate an existing resource.
//! When an expected version is supplied the store applies the patch only if
//! the stored version still matches; otherwise it answers
//! [`CasResult::Conflict`]. Two writers racing from the same read therefore
//! see exactly one `Applied` and one `Conflict`, enforced by the store.
//!
//! Conflict and NotFound are ordinary outcomes here, not errors. `Err` is
//! reserved for transport and serialization failures.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::resource::{
    NewResource, Resource, ResourceKey, ResourceKind, ResourcePatch, ResourceVersion, StateQuery,
    WatchEvent,
};
use crate::Result;

/// Outcome of a conditional patch
#[derive(Clone, Debug, PartialEq)]
pub enum CasResult {
    /// Patch applied; carries the resource at its new version
    Applied(Resource),
    /// Stored version no longer matches the expected one
    Conflict {
        /// Version the caller expected
        expected: ResourceVersion,
        /// Version currently stored, when known
        actual: Option<ResourceVersion>,
    },
    /// Resource does not exist
    NotFound,
}

impl CasResult {
    /// Returns true if the patch was applied
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns true if the caller lost the race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if the resource is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Stream of watch events; an `Err` item means the connection broke
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// CRUD + watch over typed resources
///
/// Implementations must be safe to share between tasks and processes; the
/// version check in [`ResourceStore::patch`] is the only cross-process
/// coordination primitive Fabrik relies on.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a resource, `None` if it does not exist
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>>;

    /// Create a resource; fails with [`crate::Error::Conflict`] if the id is taken
    async fn create(&self, kind: &ResourceKind, resource: NewResource) -> Result<Resource>;

    /// Apply a patch, conditionally on `expected_version` when given
    async fn patch(
        &self,
        key: &ResourceKey,
        patch: &ResourcePatch,
        expected_version: Option<&ResourceVersion>,
    ) -> Result<CasResult>;

    /// Delete a resource; returns false if it was already gone
    async fn delete(&self, key: &ResourceKey) -> Result<bool>;

    /// List resources of a kind matching the state filter
    async fn list(&self, kind: &ResourceKind, query: &StateQuery) -> Result<Vec<Resource>>;

    /// Register a watch on a kind
    ///
    /// A fresh watch first replays every matching resource as `Added`, then
    /// streams changes. Registration itself may fail; callers are expected to
    /// retry (see the operator's watch loop).
    async fn watch(&self, kind: &ResourceKind, query: &StateQuery) -> Result<WatchStream>;
}
