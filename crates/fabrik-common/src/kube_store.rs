//! Kubernetes-backed resource store
//!
//! Fabrik resources are custom resources served at
//! `<group>.servicefabrik.io/v1alpha1`, plural = resource type, all in one
//! namespace. They are handled as [`DynamicObject`]s so new resource types
//! need no code changes.
//!
//! # Atomicity
//!
//! A patch reads the object, applies the [`ResourcePatch`] to it and writes
//! it back with `replace`, carrying the `metadata.resourceVersion` it read.
//! The API server rejects the write with 409 Conflict if the object changed
//! in between, which is surfaced as [`CasResult::Conflict`]. Replacing the
//! whole object keeps `spec` and `status` replacement exact: a JSON merge
//! patch would merge them with the stored values and keep fields the patch
//! left out.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, PostParams, WatchEvent as KubeWatchEvent,
    WatchParams,
};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::resource::{
    NewResource, Resource, ResourceKey, ResourceKind, ResourceMetadata, ResourcePatch,
    ResourceStatus, ResourceVersion, StateQuery, WatchEvent, WatchEventType,
};
use crate::store::{CasResult, ResourceStore, WatchStream};
use crate::{Error, Result, API_GROUP_SUFFIX, API_VERSION, STATE_LABEL_KEY};

/// Watch timeout (seconds) - the server closes idle watches before the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Read-modify-replace rounds for a patch without an expected version
const UNCONDITIONAL_PATCH_ATTEMPTS: usize = 5;

/// Buffered watch events per subscriber before the forwarder applies backpressure
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Resource store on a Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
    namespace: String,
}

impl KubeResourceStore {
    /// Create a store for resources in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self, kind: &ResourceKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource(kind))
    }
}

/// Build the ApiResource for a Fabrik resource kind
pub fn api_resource(kind: &ResourceKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(
        &format!("{}.{}", kind.group, API_GROUP_SUFFIX),
        API_VERSION,
        &kind.resource_type,
    );
    ApiResource::from_gvk_with_plural(&gvk, &kind.resource_type)
}

/// Convert a DynamicObject into a Fabrik resource
pub fn from_dynamic(kind: &ResourceKind, obj: DynamicObject) -> Result<Resource> {
    let meta = obj.metadata;
    let id = meta
        .name
        .ok_or_else(|| Error::serialization(format!("{kind} object without a name")))?;
    let version = meta
        .resource_version
        .map(ResourceVersion::new)
        .ok_or_else(|| Error::serialization(format!("{kind}/{id} has no resourceVersion")))?;

    let mut data = match obj.data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let spec = data.remove("spec").unwrap_or(Value::Null);
    let status: ResourceStatus = match data.remove("status") {
        Some(Value::Null) | None => ResourceStatus::default(),
        Some(status) => serde_json::from_value(status)?,
    };

    Ok(Resource {
        kind: Some(kind.clone()),
        metadata: ResourceMetadata {
            id,
            version,
            annotations: meta.annotations.unwrap_or_default(),
            labels: meta.labels.unwrap_or_default(),
            creation_time: meta.creation_timestamp.map(|t| t.0).unwrap_or_else(Utc::now),
        },
        spec,
        status,
    })
}

/// Apply a ResourcePatch to an object read from the API server
///
/// `spec` and `status` replace the stored values as a whole, like
/// [`ResourcePatch::apply_to`]. The state label follows `status.state` so
/// label selectors keep working. Everything else on the object is kept.
pub fn apply_patch(obj: &mut DynamicObject, patch: &ResourcePatch) -> Result<()> {
    if !patch.annotations.is_empty() {
        let mut annotations = obj.metadata.annotations.take().unwrap_or_default();
        for (key, value) in &patch.annotations {
            match value {
                Some(v) => {
                    annotations.insert(key.clone(), v.clone());
                }
                None => {
                    annotations.remove(key);
                }
            }
        }
        obj.metadata.annotations = (!annotations.is_empty()).then_some(annotations);
    }

    if !obj.data.is_object() {
        obj.data = Value::Object(Map::new());
    }
    if let Value::Object(data) = &mut obj.data {
        if let Some(spec) = &patch.spec {
            data.insert("spec".to_string(), spec.clone());
        }
        if let Some(status) = &patch.status {
            data.insert("status".to_string(), serde_json::to_value(status)?);
        }
    }

    if let Some(status) = &patch.status {
        obj.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(STATE_LABEL_KEY.to_string(), status.state.as_str().to_string());
    }
    Ok(())
}

fn is_api_error(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == code)
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        match self.api(&key.kind).get_opt(&key.id).await? {
            Some(obj) => Ok(Some(from_dynamic(&key.kind, obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, kind: &ResourceKind, resource: NewResource) -> Result<Resource> {
        let ar = api_resource(kind);
        let mut labels = BTreeMap::new();
        labels.insert(
            STATE_LABEL_KEY.to_string(),
            resource.status.state.as_str().to_string(),
        );

        let mut obj = DynamicObject::new(&resource.id, &ar)
            .within(&self.namespace)
            .data(json!({
                "spec": resource.spec,
                "status": resource.status,
            }));
        obj.metadata.labels = Some(labels);
        if !resource.annotations.is_empty() {
            obj.metadata.annotations = Some(resource.annotations);
        }

        match self.api(kind).create(&PostParams::default(), &obj).await {
            Ok(created) => from_dynamic(kind, created),
            Err(e) if is_api_error(&e, 409) => Err(Error::conflict(
                kind.key(resource.id).to_string(),
                "resource already exists",
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        patch: &ResourcePatch,
        expected_version: Option<&ResourceVersion>,
    ) -> Result<CasResult> {
        let api = self.api(&key.kind);

        // Unconditional patches are applied to the latest version; a writer
        // racing between read and replace makes us read again
        for _ in 0..UNCONDITIONAL_PATCH_ATTEMPTS {
            let Some(mut obj) = api.get_opt(&key.id).await? else {
                return Ok(CasResult::NotFound);
            };
            let stored = obj.metadata.resource_version.clone().map(ResourceVersion::new);
            if let Some(expected) = expected_version {
                if stored.as_ref() != Some(expected) {
                    debug!(resource = %key, "version mismatch, rejecting patch");
                    return Ok(CasResult::Conflict {
                        expected: expected.clone(),
                        actual: stored,
                    });
                }
            }

            apply_patch(&mut obj, patch)?;
            match api.replace(&key.id, &PostParams::default(), &obj).await {
                Ok(updated) => return Ok(CasResult::Applied(from_dynamic(&key.kind, updated)?)),
                Err(e) if is_api_error(&e, 409) => match expected_version {
                    Some(expected) => {
                        debug!(resource = %key, "conditional patch conflict");
                        return Ok(CasResult::Conflict {
                            expected: expected.clone(),
                            actual: None,
                        });
                    }
                    None => debug!(resource = %key, "resource changed during patch, re-reading"),
                },
                Err(e) if is_api_error(&e, 404) => return Ok(CasResult::NotFound),
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::conflict(
            key.to_string(),
            "resource changed on every patch attempt",
        ))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        match self
            .api(&key.kind)
            .delete(&key.id, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_api_error(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, kind: &ResourceKind, query: &StateQuery) -> Result<Vec<Resource>> {
        let mut params = ListParams::default();
        if let Some(selector) = query.label_selector() {
            params = params.labels(&selector);
        }
        let list = self.api(kind).list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| from_dynamic(kind, obj))
            .collect()
    }

    async fn watch(&self, kind: &ResourceKind, query: &StateQuery) -> Result<WatchStream> {
        let api = self.api(kind);
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(selector) = query.label_selector() {
            params = params.labels(&selector);
        }

        // The forwarder owns the Api so the stream outlives this call.
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let kind = kind.clone();
        tokio::spawn(async move {
            let stream = match api.watch(&params, "0").await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tokio::pin!(stream);

            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(KubeWatchEvent::Added(obj)) => {
                        from_dynamic(&kind, obj).map(|o| (WatchEventType::Added, o))
                    }
                    Ok(KubeWatchEvent::Modified(obj)) => {
                        from_dynamic(&kind, obj).map(|o| (WatchEventType::Modified, o))
                    }
                    Ok(KubeWatchEvent::Deleted(obj)) => {
                        from_dynamic(&kind, obj).map(|o| (WatchEventType::Deleted, o))
                    }
                    Ok(KubeWatchEvent::Bookmark(_)) => continue,
                    Ok(KubeWatchEvent::Error(e)) => {
                        warn!(kind = %kind, code = e.code, message = %e.message, "watch error event");
                        let _ = tx
                            .send(Err(Error::unavailable("watch", e.message)))
                            .await;
                        return;
                    }
                    Err(e) => Err(e.into()),
                };

                let event = event.map(|(event_type, object)| WatchEvent { event_type, object });
                let broken = event.is_err();
                if tx.send(event).await.is_err() || broken {
                    return;
                }
            }
            debug!(kind = %kind, "watch stream closed by server");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(ReceiverStream::new(rx).boxed()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::internal_with_context(
                "watch",
                "watch forwarder exited before registration",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceState;
    use kube::api::ObjectMeta;

    fn directors() -> ResourceKind {
        ResourceKind::new("deployment", "directors")
    }

    #[test]
    fn api_resource_uses_fabrik_group() {
        let ar = api_resource(&directors());
        assert_eq!(ar.group, "deployment.servicefabrik.io");
        assert_eq!(ar.version, "v1alpha1");
        assert_eq!(ar.plural, "directors");
        assert_eq!(ar.api_version, "deployment.servicefabrik.io/v1alpha1");
    }

    #[test]
    fn dynamic_object_converts_to_resource() {
        let ar = api_resource(&directors());
        let mut obj = DynamicObject::new("d-7", &ar).data(json!({
            "spec": {"options": {"plan_id": "small"}},
            "status": {"state": "in_queue", "response": {"task_id": "t-1"}}
        }));
        obj.metadata = ObjectMeta {
            name: Some("d-7".to_string()),
            resource_version: Some("4711".to_string()),
            annotations: Some(BTreeMap::from([(
                "lockedByManager".to_string(),
                "broker-0".to_string(),
            )])),
            ..Default::default()
        };

        let resource = from_dynamic(&directors(), obj).unwrap();
        assert_eq!(resource.id(), "d-7");
        assert_eq!(resource.version().as_str(), "4711");
        assert_eq!(resource.state(), ResourceState::InQueue);
        assert_eq!(resource.annotation("lockedByManager"), Some("broker-0"));
        assert_eq!(resource.spec["options"]["plan_id"], "small");
        assert_eq!(resource.status.response.unwrap()["task_id"], "t-1");
    }

    #[test]
    fn dynamic_object_without_version_is_rejected() {
        let ar = api_resource(&directors());
        let obj = DynamicObject::new("d-7", &ar);
        assert!(from_dynamic(&directors(), obj).is_err());
    }

    fn stored_lock() -> DynamicObject {
        let ar = api_resource(&ResourceKind::new("lock", "deploymentlocks"));
        let mut obj = DynamicObject::new("i-1", &ar).data(json!({
            "spec": {"lockType": "write", "lockTTL": 0, "lockTime": "2024-01-01T00:00:00Z"},
            "status": {"state": "locked", "error": {"code": "Stale"}},
            "extra": "kept"
        }));
        obj.metadata = ObjectMeta {
            name: Some("i-1".to_string()),
            resource_version: Some("42".to_string()),
            uid: Some("uid-1".to_string()),
            labels: Some(BTreeMap::from([("state".to_string(), "locked".to_string())])),
            annotations: Some(BTreeMap::from([
                ("owner".to_string(), "broker-0".to_string()),
                ("stale".to_string(), "x".to_string()),
            ])),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn patch_replaces_spec_and_status_wholesale() {
        let mut obj = stored_lock();
        let patch = ResourcePatch::new()
            .with_spec(json!({"lockType": "write", "lockTime": "2024-01-02T00:00:00Z"}))
            .with_status(ResourceStatus::with_state(ResourceState::Locked));
        apply_patch(&mut obj, &patch).unwrap();

        assert!(obj.data["spec"].get("lockTTL").is_none());
        assert_eq!(obj.data["spec"]["lockTime"], "2024-01-02T00:00:00Z");
        assert!(obj.data["status"].get("error").is_none());
        assert_eq!(obj.data["extra"], "kept");
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(obj.metadata.uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn patch_updates_annotations_and_state_label() {
        let mut obj = stored_lock();
        let patch = ResourcePatch::new()
            .set_annotation("owner", "broker-1")
            .remove_annotation("stale")
            .with_status(ResourceStatus::with_state(ResourceState::Unlocked));
        apply_patch(&mut obj, &patch).unwrap();

        let annotations = obj.metadata.annotations.unwrap();
        assert_eq!(annotations.get("owner").map(String::as_str), Some("broker-1"));
        assert!(!annotations.contains_key("stale"));
        assert_eq!(obj.metadata.labels.unwrap()["state"], "unlocked");
        assert_eq!(obj.data["spec"]["lockTTL"], 0);
    }

    #[test]
    fn removing_last_annotation_clears_the_map() {
        let mut obj = stored_lock();
        let patch = ResourcePatch::new()
            .remove_annotation("owner")
            .remove_annotation("stale");
        apply_patch(&mut obj, &patch).unwrap();
        assert!(obj.metadata.annotations.is_none());
        assert_eq!(obj.metadata.labels.unwrap()["state"], "locked");
    }
}
