//! Resource model shared by every store implementation
//!
//! A [`Resource`] is a versioned record identified by (group, type, id).
//! Operators never mutate a resource in place: they build a [`ResourcePatch`]
//! and hand it to the store together with the version they last observed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// (group, type) pair naming a class of resources
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    /// Resource group (e.g. "deployment", "lock")
    pub group: String,
    /// Resource type within the group (e.g. "directors", "deploymentlocks")
    pub resource_type: String,
}

impl ResourceKind {
    /// Create a kind from group and type
    pub fn new(group: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource_type: resource_type.into(),
        }
    }

    /// Key for a single resource of this kind
    pub fn key(&self, id: impl Into<String>) -> ResourceKey {
        ResourceKey {
            kind: self.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.resource_type)
    }
}

/// Fully qualified identity of one resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Group and type
    pub kind: ResourceKind,
    /// Resource id (the object name)
    pub id: String,
}

impl ResourceKey {
    /// Create a key from its parts
    pub fn new(
        group: impl Into<String>,
        resource_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        ResourceKind::new(group, resource_type).key(id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Opaque, monotonically increasing version token assigned by the store
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    /// Wrap a raw version string
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    /// Raw version string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Accepted by the API, waiting for an operator
    InQueue,
    /// Dispatched downstream, waiting for completion
    InProgress,
    /// Update requested
    Update,
    /// Delete requested
    Delete,
    /// Operation completed successfully
    Succeeded,
    /// Operation failed
    Failed,
    /// Delete operation failed
    DeleteFailed,
    /// Operation aborted
    Aborted,
    /// Lock record is held
    Locked,
    /// Lock record is released
    Unlocked,
    /// State not set or not understood by this version
    #[default]
    #[serde(other)]
    Unknown,
}

impl ResourceState {
    /// Wire representation (also used as label value)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InQueue => "in_queue",
            Self::InProgress => "in_progress",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeleteFailed => "delete_failed",
            Self::Aborted => "aborted",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Unknown => "unknown",
        }
    }

    /// True once the operation behind the resource can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::DeleteFailed | Self::Aborted
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    /// Resource id
    pub id: String,
    /// Version token the resource was read at
    pub version: ResourceVersion,
    /// Free-form annotations (lock ownership lives here)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Creation time
    pub creation_time: DateTime<Utc>,
}

/// Observed status of a resource
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Current state
    #[serde(default)]
    pub state: ResourceState,
    /// Operation response payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Error payload of a failed operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl ResourceStatus {
    /// Status with only a state set
    pub fn with_state(state: ResourceState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }
}

/// A versioned record in the resource store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Group and type
    #[serde(skip)]
    pub kind: Option<ResourceKind>,
    /// Metadata
    pub metadata: ResourceMetadata,
    /// Operation-specific payload
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Observed status
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    /// Resource id
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Version token the resource was read at
    pub fn version(&self) -> &ResourceVersion {
        &self.metadata.version
    }

    /// Current state
    pub fn state(&self) -> ResourceState {
        self.status.state
    }

    /// Annotation value, if present and non-empty
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Deserialize the spec into a typed payload
    pub fn spec_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }
}

/// Request to create a resource
#[derive(Clone, Debug, PartialEq)]
pub struct NewResource {
    /// Resource id
    pub id: String,
    /// Initial annotations
    pub annotations: BTreeMap<String, String>,
    /// Operation-specific payload
    pub spec: serde_json::Value,
    /// Initial status
    pub status: ResourceStatus,
}

impl NewResource {
    /// New resource with the given spec and initial state
    pub fn new(id: impl Into<String>, spec: serde_json::Value, state: ResourceState) -> Self {
        Self {
            id: id.into(),
            annotations: BTreeMap::new(),
            spec,
            status: ResourceStatus::with_state(state),
        }
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// Merge-style change to a resource
///
/// Annotations mapped to `None` are removed. A `status` replaces the
/// stored status as a whole; `spec` replaces the stored spec.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourcePatch {
    /// Annotation changes (`None` removes the key)
    pub annotations: BTreeMap<String, Option<String>>,
    /// Replacement spec
    pub spec: Option<serde_json::Value>,
    /// Replacement status
    pub status: Option<ResourceStatus>,
}

impl ResourcePatch {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an annotation
    pub fn set_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), Some(value.into()));
        self
    }

    /// Remove an annotation
    pub fn remove_annotation(mut self, key: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), None);
        self
    }

    /// Replace the spec
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Replace the status
    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Apply this patch to a resource in place (store implementations use this)
    pub fn apply_to(&self, resource: &mut Resource) {
        for (key, value) in &self.annotations {
            match value {
                Some(v) => {
                    resource.metadata.annotations.insert(key.clone(), v.clone());
                }
                None => {
                    resource.metadata.annotations.remove(key);
                }
            }
        }
        if let Some(spec) = &self.spec {
            resource.spec = spec.clone();
        }
        if let Some(status) = &self.status {
            resource.status = status.clone();
            resource.metadata.labels.insert(
                crate::STATE_LABEL_KEY.to_string(),
                status.state.as_str().to_string(),
            );
        }
    }
}

/// Server-side filter on resource state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateQuery {
    /// Every resource
    Any,
    /// Resources whose state is one of these
    In(Vec<ResourceState>),
    /// Resources whose state is none of these
    NotIn(Vec<ResourceState>),
}

impl StateQuery {
    /// True if a resource in `state` passes the filter
    pub fn matches(&self, state: ResourceState) -> bool {
        match self {
            Self::Any => true,
            Self::In(states) => states.contains(&state),
            Self::NotIn(states) => !states.contains(&state),
        }
    }

    /// Kubernetes label selector equivalent (e.g. `state in (in_queue,update)`)
    pub fn label_selector(&self) -> Option<String> {
        let join = |states: &[ResourceState]| {
            states
                .iter()
                .map(ResourceState::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            Self::Any => None,
            Self::In(states) => Some(format!("{} in ({})", crate::STATE_LABEL_KEY, join(states))),
            Self::NotIn(states) => Some(format!(
                "{} notin ({})",
                crate::STATE_LABEL_KEY,
                join(states)
            )),
        }
    }
}

/// Type of a watch event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    /// Resource appeared (including the initial listing of a new watch)
    Added,
    /// Resource changed
    Modified,
    /// Resource was removed
    Deleted,
}

impl fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("ADDED"),
            Self::Modified => f.write_str("MODIFIED"),
            Self::Deleted => f.write_str("DELETED"),
        }
    }
}

/// Change notification delivered by a watch stream
#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent {
    /// What happened
    pub event_type: WatchEventType,
    /// Resource as of the event
    pub object: Resource,
}
