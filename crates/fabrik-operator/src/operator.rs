//! Resource operator
//!
//! A [`ResourceOperator`] watches `deployment/<type>` for every type in its
//! [`OperatorRegistry`]. For each request (`in_queue`, `update`, `delete`) it
//! claims the processing lock, dispatches to the registered
//! [`OperatorService`] and writes the outcome back:
//!
//! | outcome           | resource afterwards                          |
//! |-------------------|----------------------------------------------|
//! | `Succeeded`       | `succeeded` + response (delete: removed)     |
//! | `InProgress`      | `in_progress` + response                     |
//! | `Deferred`        | unchanged; retried when the watch refreshes  |
//! | error             | `failed` + error                             |
//!
//! The processing lock is released in every case.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fabrik_common::config::FabrikConfig;
use fabrik_common::resource::{
    Resource, ResourceKey, ResourceKind, ResourcePatch, ResourceState, ResourceStatus,
    StateQuery, WatchEvent, WatchEventType,
};
use fabrik_common::store::{CasResult, ResourceStore};
use fabrik_common::{Error, Result, DEPLOYMENT_RESOURCE_GROUP};

use crate::lock::{AcquireOutcome, LockManager, LockedResourceDetails, PROCESSING_LOCK_ANNOTATION};
use crate::watch::{spawn_watch_loop, WatchConfig};

/// Attempts at writing a request outcome
const PERSIST_ATTEMPTS: u32 = 5;

/// Pause after a failed outcome write
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// States that carry a pending request
pub const REQUEST_STATES: [ResourceState; 3] = [
    ResourceState::InQueue,
    ResourceState::Update,
    ResourceState::Delete,
];

/// Result of a service call
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceOutcome {
    /// Operation completed; carries the response
    Succeeded(serde_json::Value),
    /// Operation dispatched and running; carries the response (e.g. a task id)
    InProgress(serde_json::Value),
    /// Operation not dispatched yet; try again later
    Deferred,
}

/// Lifecycle operations for one resource type
#[async_trait]
pub trait OperatorService: Send + Sync {
    /// Handle a resource in `in_queue`
    async fn create(&self, resource: &Resource) -> Result<ServiceOutcome>;

    /// Handle a resource in `update`
    async fn update(&self, resource: &Resource) -> Result<ServiceOutcome>;

    /// Handle a resource in `delete`
    async fn delete(&self, resource: &Resource) -> Result<ServiceOutcome>;
}

/// Services keyed by resource type
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    services: BTreeMap<String, Arc<dyn OperatorService>>,
}

impl OperatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the service for a resource type, replacing any previous one
    pub fn register(
        &mut self,
        resource_type: impl Into<String>,
        service: Arc<dyn OperatorService>,
    ) -> &mut Self {
        self.services.insert(resource_type.into(), service);
        self
    }

    /// Service for a resource type
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn OperatorService>> {
        self.services.get(resource_type).cloned()
    }

    /// Registered resource types
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

struct OperatorInner {
    store: Arc<dyn ResourceStore>,
    registry: OperatorRegistry,
    lock: LockManager,
    /// Resources being processed by this instance
    in_flight: DashMap<ResourceKey, ()>,
    /// Deferred resources and the state they were deferred in
    deferred: DashMap<ResourceKey, ResourceState>,
}

/// Watch-driven operator dispatching requests to registered services
pub struct ResourceOperator {
    inner: Arc<OperatorInner>,
    watch: WatchConfig,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl ResourceOperator {
    /// Create an operator; nothing runs until [`ResourceOperator::start`]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: OperatorRegistry,
        config: &FabrikConfig,
        identity: &str,
    ) -> Self {
        let lock = LockManager::new(
            store.clone(),
            PROCESSING_LOCK_ANNOTATION,
            identity,
            config.locks.processing_timeout(),
        );
        Self {
            inner: Arc::new(OperatorInner {
                store,
                registry,
                lock,
                in_flight: DashMap::new(),
                deferred: DashMap::new(),
            }),
            watch: WatchConfig::from(&config.pollers),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override watch timing
    pub fn with_watch_config(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    /// Start one watch per registered resource type; later calls are no-ops
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for resource_type in self.inner.registry.resource_types() {
            let kind = ResourceKind::new(DEPLOYMENT_RESOURCE_GROUP, resource_type);
            info!(kind = %kind, "Starting operator");
            let inner = self.inner.clone();
            spawn_watch_loop(
                self.inner.store.clone(),
                kind,
                StateQuery::In(REQUEST_STATES.to_vec()),
                self.watch,
                self.shutdown.child_token(),
                move |event| inner.clone().on_event(event),
            );
        }
    }

    /// Stop every watch
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// True while this instance processes the resource
    pub fn is_processing(&self, key: &ResourceKey) -> bool {
        self.inner.in_flight.contains_key(key)
    }
}

impl Drop for ResourceOperator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl OperatorInner {
    fn on_event(self: Arc<Self>, event: WatchEvent) {
        let resource = event.object;
        let Some(kind) = resource.kind.clone() else {
            warn!(resource = %resource.id(), "Watch event without resource kind, ignoring");
            return;
        };
        let key = kind.key(resource.id());
        if event.event_type == WatchEventType::Deleted {
            self.deferred.remove(&key);
            return;
        }
        let state = resource.state();
        if !REQUEST_STATES.contains(&state) {
            return;
        }

        // A deferred request is retried on the next watch replay or when its
        // state changes, not on every write to it
        if event.event_type == WatchEventType::Modified
            && self.deferred.get(&key).is_some_and(|s| *s == state)
        {
            return;
        }
        self.deferred.remove(&key);

        if self.in_flight.insert(key.clone(), ()).is_some() {
            debug!(resource = %key, "Already processing, ignoring event");
            return;
        }
        tokio::spawn(async move {
            self.process(&key, &resource).await;
            self.in_flight.remove(&key);
        });
    }

    async fn process(&self, key: &ResourceKey, observed: &Resource) {
        let details = LockedResourceDetails::new(key, observed.state().as_str());
        let resource = match self.lock.acquire_observed(key, observed, details).await {
            Ok(AcquireOutcome::Acquired(resource)) => resource,
            Ok(AcquireOutcome::Conflict { holder }) => {
                debug!(resource = %key, holder = ?holder, "Processing lock not acquired");
                return;
            }
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!(resource = %key, error = %e, "Failed to acquire processing lock");
                return;
            }
        };

        let state = resource.state();
        info!(resource = %key, state = %state, "Processing request");
        let outcome = self.dispatch(key, &resource).await;
        if let Err(e) = self.persist(key, &resource, state, outcome).await {
            error!(resource = %key, error = %e, "Failed to persist operation outcome");
        }

        match self.lock.release(key).await {
            Ok(outcome) => debug!(resource = %key, outcome = ?outcome, "Processing lock released"),
            Err(e) => warn!(
                resource = %key,
                error = %e,
                "Failed to release processing lock, it will expire"
            ),
        }
    }

    async fn dispatch(&self, key: &ResourceKey, resource: &Resource) -> Result<ServiceOutcome> {
        let service = self
            .registry
            .get(&key.kind.resource_type)
            .ok_or_else(|| Error::service(key.to_string(), "no service registered"))?;
        match resource.state() {
            ResourceState::InQueue => service.create(resource).await,
            ResourceState::Update => service.update(resource).await,
            ResourceState::Delete => service.delete(resource).await,
            other => Err(Error::service(
                key.to_string(),
                format!("no operation for state {other}"),
            )),
        }
    }

    async fn persist(
        &self,
        key: &ResourceKey,
        resource: &Resource,
        state: ResourceState,
        outcome: Result<ServiceOutcome>,
    ) -> Result<()> {
        let status = match outcome {
            Ok(ServiceOutcome::Succeeded(_)) if state == ResourceState::Delete => {
                self.store.delete(key).await?;
                info!(resource = %key, "Resource deleted");
                return Ok(());
            }
            Ok(ServiceOutcome::Succeeded(response)) => ResourceStatus {
                state: ResourceState::Succeeded,
                response: Some(response),
                error: None,
            },
            Ok(ServiceOutcome::InProgress(response)) => ResourceStatus {
                state: ResourceState::InProgress,
                response: Some(response),
                error: None,
            },
            Ok(ServiceOutcome::Deferred) => {
                info!(resource = %key, state = %state, "Request deferred");
                self.deferred.insert(key.clone(), state);
                return Ok(());
            }
            Err(e) => {
                error!(resource = %key, state = %state, error = %e, "Request failed");
                ResourceStatus {
                    state: if state == ResourceState::Delete {
                        ResourceState::DeleteFailed
                    } else {
                        ResourceState::Failed
                    },
                    response: resource.status.response.clone(),
                    error: Some(error_payload(&e)),
                }
            }
        };

        let new_state = status.state;
        self.write_status(key, resource, state, status).await?;
        info!(resource = %key, state = %new_state, "Request processed");
        Ok(())
    }

    /// Write the outcome of a dispatched request
    ///
    /// The work already ran, so losing this write would dispatch it again on
    /// the next replay. Unrelated writes and transient store failures are
    /// retried against a fresh version as long as the resource still carries
    /// our processing lock and the request state we handled.
    async fn write_status(
        &self,
        key: &ResourceKey,
        resource: &Resource,
        state: ResourceState,
        status: ResourceStatus,
    ) -> Result<()> {
        let patch = ResourcePatch::new().with_status(status);
        let mut version = resource.version().clone();

        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.store.patch(key, &patch, Some(&version)).await {
                Ok(CasResult::Applied(_)) => return Ok(()),
                Ok(CasResult::NotFound) => return Err(Error::not_found(key.to_string())),
                Ok(CasResult::Conflict { .. }) => {
                    debug!(resource = %key, attempt, "Resource changed while processing, re-reading");
                }
                Err(e) if e.is_retryable() => {
                    warn!(resource = %key, attempt, error = %e, "Failed to write outcome, retrying");
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }

            let Some(fresh) = self.store.get(key).await? else {
                return Err(Error::not_found(key.to_string()));
            };
            if !self.lock.holds(&fresh) || fresh.state() != state {
                return Err(Error::conflict(
                    key.to_string(),
                    format!("request taken over while processing (now {})", fresh.state()),
                ));
            }
            version = fresh.version().clone();
        }

        Err(Error::conflict(
            key.to_string(),
            "resource kept changing while writing the outcome",
        ))
    }
}

/// Error details persisted on a failed resource
fn error_payload(error: &Error) -> serde_json::Value {
    let code = match error {
        Error::Service { .. } => "ServiceError",
        Error::Director(_) => "DirectorError",
        Error::DeploymentAttemptRejected { .. } => "DeploymentAttemptRejected",
        Error::Unavailable { .. } => "Unavailable",
        Error::Serialization(_) => "InvalidSpec",
        _ => "InternalError",
    };
    json!({
        "code": code,
        "message": error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_common::memory::InMemoryStore;
    use fabrik_common::resource::NewResource;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    fn directors() -> ResourceKind {
        ResourceKind::new(DEPLOYMENT_RESOURCE_GROUP, "directors")
    }

    /// Records calls and answers from a fixed outcome
    struct Recording {
        outcome: Mutex<Box<dyn FnMut() -> Result<ServiceOutcome> + Send>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Recording {
        fn new(outcome: impl FnMut() -> Result<ServiceOutcome> + Send + 'static) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(Box::new(outcome)),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, op: &str, resource: &Resource) -> Result<ServiceOutcome> {
            self.calls
                .lock()
                .push((op.to_string(), resource.id().to_string()));
            let mut outcome = self.outcome.lock();
            (*outcome)()
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl OperatorService for Recording {
        async fn create(&self, resource: &Resource) -> Result<ServiceOutcome> {
            self.record("create", resource)
        }

        async fn update(&self, resource: &Resource) -> Result<ServiceOutcome> {
            self.record("update", resource)
        }

        async fn delete(&self, resource: &Resource) -> Result<ServiceOutcome> {
            self.record("delete", resource)
        }
    }

    fn operator(store: &Arc<InMemoryStore>, service: Arc<Recording>) -> ResourceOperator {
        let mut registry = OperatorRegistry::new();
        registry.register("directors", service);
        ResourceOperator::new(store.clone(), registry, &FabrikConfig::default(), "broker-0")
            .with_watch_config(WatchConfig {
                refresh_interval: Duration::from_secs(60),
                error_delay: Duration::from_millis(5),
            })
    }

    async fn wait_for_state(store: &InMemoryStore, id: &str, state: ResourceState) -> Resource {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(resource) = store.get(&directors().key(id)).await.unwrap() {
                if resource.state() == state && resource.annotation(PROCESSING_LOCK_ANNOTATION).is_none() {
                    return resource;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {id} to reach {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn create_success_is_persisted_and_lock_released() {
        let store = Arc::new(InMemoryStore::new());
        let service = Recording::new(|| Ok(ServiceOutcome::Succeeded(json!({"dashboard_url": "/d-1"}))));
        let operator = operator(&store, service.clone());
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::InQueue))
            .await
            .unwrap();

        let resource = wait_for_state(&store, "d-1", ResourceState::Succeeded).await;
        assert_eq!(resource.status.response, Some(json!({"dashboard_url": "/d-1"})));
        assert_eq!(service.calls(), vec![("create".to_string(), "d-1".to_string())]);
    }

    #[tokio::test]
    async fn in_progress_outcome_hands_over_to_polling() {
        let store = Arc::new(InMemoryStore::new());
        let service = Recording::new(|| Ok(ServiceOutcome::InProgress(json!({"task_id": "42"}))));
        let operator = operator(&store, service.clone());
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::Update))
            .await
            .unwrap();

        let resource = wait_for_state(&store, "d-1", ResourceState::InProgress).await;
        assert_eq!(resource.status.response, Some(json!({"task_id": "42"})));
        assert_eq!(service.calls()[0].0, "update");
    }

    #[tokio::test]
    async fn service_errors_mark_resource_failed() {
        let store = Arc::new(InMemoryStore::new());
        let service = Recording::new(|| Err(Error::director("deployment manifest rejected")));
        let operator = operator(&store, service.clone());
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::InQueue))
            .await
            .unwrap();

        let resource = wait_for_state(&store, "d-1", ResourceState::Failed).await;
        let error = resource.status.error.unwrap();
        assert_eq!(error["code"], "DirectorError");
        assert!(error["message"].as_str().unwrap().contains("manifest rejected"));
    }

    #[tokio::test]
    async fn successful_delete_removes_resource() {
        let store = Arc::new(InMemoryStore::new());
        let service = Recording::new(|| Ok(ServiceOutcome::Succeeded(json!({}))));
        let operator = operator(&store, service.clone());
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::Delete))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.get(&directors().key("d-1")).await.unwrap().is_some() {
            assert!(Instant::now() < deadline, "resource was not deleted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.calls(), vec![("delete".to_string(), "d-1".to_string())]);
    }

    #[tokio::test]
    async fn deferred_request_waits_for_replay() {
        let store = Arc::new(InMemoryStore::new());
        let mut deferrals = 1;
        let service = Recording::new(move || {
            if deferrals > 0 {
                deferrals -= 1;
                Ok(ServiceOutcome::Deferred)
            } else {
                Ok(ServiceOutcome::InProgress(json!({"task_id": "7"})))
            }
        });
        let mut registry = OperatorRegistry::new();
        registry.register("directors", service.clone());
        let operator = ResourceOperator::new(
            store.clone(),
            registry,
            &FabrikConfig::default(),
            "broker-0",
        )
        .with_watch_config(WatchConfig {
            refresh_interval: Duration::from_millis(200),
            error_delay: Duration::from_millis(5),
        });
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::InQueue))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.calls().is_empty() {
            assert!(Instant::now() < deadline, "request was never dispatched");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Released lock writes do not retrigger the deferred request
        let resource = wait_for_state(&store, "d-1", ResourceState::InQueue).await;
        assert!(resource.status.response.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.calls().len(), 1);

        // The watch refresh replays it
        wait_for_state(&store, "d-1", ResourceState::InProgress).await;
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn request_locked_elsewhere_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::InQueue))
            .await
            .unwrap();
        let key = directors().key("d-1");
        let other = LockManager::new(
            store.clone(),
            PROCESSING_LOCK_ANNOTATION,
            "broker-other",
            Duration::from_secs(300),
        );
        other
            .acquire(&key, LockedResourceDetails::new(&key, "in_queue"))
            .await
            .unwrap();

        let service = Recording::new(|| Ok(ServiceOutcome::Succeeded(json!({}))));
        let operator = operator(&store, service.clone());
        operator.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.calls().is_empty());
        let resource = store.get(&key).await.unwrap().unwrap();
        assert_eq!(resource.state(), ResourceState::InQueue);
    }

    #[tokio::test]
    async fn rejected_scheduled_attempt_is_recorded_as_failed() {
        let store = Arc::new(InMemoryStore::new());
        let service = Recording::new(|| {
            Err(Error::DeploymentAttemptRejected {
                deployment: "service-fabrik-d-1".to_string(),
            })
        });
        let operator = operator(&store, service.clone());
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::Update))
            .await
            .unwrap();

        let resource = wait_for_state(&store, "d-1", ResourceState::Failed).await;
        assert_eq!(resource.status.error.unwrap()["code"], "DeploymentAttemptRejected");
        assert_eq!(service.calls().len(), 1);
    }

    /// Writes to the resource it is processing, like a concurrent user edit
    struct Touching {
        store: Arc<InMemoryStore>,
        fail_outcome_writes: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperatorService for Touching {
        async fn create(&self, resource: &Resource) -> Result<ServiceOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.store
                .patch(
                    &directors().key(resource.id()),
                    &ResourcePatch::new().set_annotation("touched", n.to_string()),
                    None,
                )
                .await?;
            self.store.fail_next_patches(self.fail_outcome_writes);
            Ok(ServiceOutcome::InProgress(json!({"task_id": "42"})))
        }

        async fn update(&self, resource: &Resource) -> Result<ServiceOutcome> {
            self.create(resource).await
        }

        async fn delete(&self, resource: &Resource) -> Result<ServiceOutcome> {
            self.create(resource).await
        }
    }

    async fn dispatch_with_concurrent_write(fail_outcome_writes: usize) {
        let store = Arc::new(InMemoryStore::new());
        let service = Arc::new(Touching {
            store: store.clone(),
            fail_outcome_writes,
            calls: AtomicUsize::new(0),
        });
        let mut registry = OperatorRegistry::new();
        registry.register("directors", service.clone());
        let operator = ResourceOperator::new(
            store.clone(),
            registry,
            &FabrikConfig::default(),
            "broker-0",
        )
        .with_watch_config(WatchConfig {
            refresh_interval: Duration::from_millis(100),
            error_delay: Duration::from_millis(5),
        });
        operator.start();

        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::InQueue))
            .await
            .unwrap();

        let resource = wait_for_state(&store, "d-1", ResourceState::InProgress).await;
        assert_eq!(resource.status.response, Some(json!({"task_id": "42"})));
        assert_eq!(resource.annotation("touched"), Some("0"));

        // Several watch refreshes later the work has still been dispatched once
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outcome_survives_concurrent_write() {
        dispatch_with_concurrent_write(0).await;
    }

    #[tokio::test]
    async fn outcome_write_retries_transient_failures() {
        dispatch_with_concurrent_write(2).await;
    }

    #[tokio::test]
    async fn deleted_deferred_request_is_forgotten() {
        let store = Arc::new(InMemoryStore::new());
        let service = Recording::new(|| Ok(ServiceOutcome::Deferred));
        let operator = operator(&store, service.clone());
        operator.start();

        let key = directors().key("d-1");
        store
            .create(&directors(), NewResource::new("d-1", json!({}), ResourceState::InQueue))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !operator.inner.deferred.contains_key(&key) {
            assert!(Instant::now() < deadline, "request was never deferred");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        store.delete(&key).await.unwrap();
        while operator.inner.deferred.contains_key(&key) {
            assert!(Instant::now() < deadline, "deferred entry outlived the resource");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
