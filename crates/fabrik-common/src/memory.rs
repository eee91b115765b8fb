//! In-memory resource store
//!
//! [`InMemoryStore`] implements [`ResourceStore`] with the same CAS and watch
//! semantics as the Kubernetes-backed store. It backs unit and integration
//! tests, and lets several pollers in one process contend for the same
//! resources as if they were separate brokers.
//!
//! ## Limitations
//!
//! - No durability: all state is lost when the process exits
//! - Single process: state is not shared across process boundaries
//! - Watch subscribers that fall behind by more than the channel capacity see
//!   their stream end with an error, like a dropped connection

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::resource::{
    NewResource, Resource, ResourceKey, ResourceKind, ResourceMetadata, ResourcePatch,
    ResourceVersion, StateQuery, WatchEvent, WatchEventType,
};
use crate::store::{CasResult, ResourceStore, WatchStream};
use crate::{Error, Result, STATE_LABEL_KEY};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryState {
    resources: BTreeMap<ResourceKey, Resource>,
    last_version: u64,
}

impl MemoryState {
    fn next_version(&mut self) -> ResourceVersion {
        self.last_version += 1;
        ResourceVersion::new(self.last_version.to_string())
    }
}

/// In-memory store for tests and local development
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<(ResourceKind, WatchEvent)>,
    rejected_watches: AtomicUsize,
    failed_patches: AtomicUsize,
    watch_registrations: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            rejected_watches: AtomicUsize::new(0),
            failed_patches: AtomicUsize::new(0),
            watch_registrations: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` watch registrations fail as if the server were unreachable
    pub fn reject_next_watches(&self, n: usize) {
        self.rejected_watches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` patches fail with a transport error
    pub fn fail_next_patches(&self, n: usize) {
        self.failed_patches.store(n, Ordering::SeqCst);
    }

    /// Number of watch registrations that succeeded so far
    pub fn watch_registrations(&self) -> usize {
        self.watch_registrations.load(Ordering::SeqCst)
    }

    /// Number of resources currently stored
    pub fn len(&self) -> usize {
        self.state.lock().resources.len()
    }

    /// True if no resources are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn publish(&self, kind: &ResourceKind, event_type: WatchEventType, object: Resource) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send((kind.clone(), WatchEvent { event_type, object }));
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        Ok(self.state.lock().resources.get(key).cloned())
    }

    async fn create(&self, kind: &ResourceKind, resource: NewResource) -> Result<Resource> {
        let key = kind.key(resource.id.clone());
        let mut state = self.state.lock();
        if state.resources.contains_key(&key) {
            return Err(Error::conflict(key.to_string(), "resource already exists"));
        }

        let mut labels = BTreeMap::new();
        labels.insert(
            STATE_LABEL_KEY.to_string(),
            resource.status.state.as_str().to_string(),
        );
        let created = Resource {
            kind: Some(kind.clone()),
            metadata: ResourceMetadata {
                id: resource.id,
                version: state.next_version(),
                annotations: resource.annotations,
                labels,
                creation_time: Utc::now(),
            },
            spec: resource.spec,
            status: resource.status,
        };
        state.resources.insert(key, created.clone());
        self.publish(kind, WatchEventType::Added, created.clone());
        Ok(created)
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        patch: &ResourcePatch,
        expected_version: Option<&ResourceVersion>,
    ) -> Result<CasResult> {
        if Self::take_injected(&self.failed_patches) {
            return Err(Error::unavailable("store", "injected patch failure"));
        }

        let mut state = self.state.lock();
        let version = state.next_version();
        let Some(current) = state.resources.get_mut(key) else {
            return Ok(CasResult::NotFound);
        };

        if let Some(expected) = expected_version {
            if current.metadata.version != *expected {
                debug!(
                    resource = %key,
                    expected = %expected,
                    actual = %current.metadata.version,
                    "version mismatch, rejecting patch"
                );
                return Ok(CasResult::Conflict {
                    expected: expected.clone(),
                    actual: Some(current.metadata.version.clone()),
                });
            }
        }

        patch.apply_to(current);
        current.metadata.version = version;
        let updated = current.clone();
        self.publish(&key.kind, WatchEventType::Modified, updated.clone());
        Ok(CasResult::Applied(updated))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        let mut state = self.state.lock();
        match state.resources.remove(key) {
            Some(removed) => {
                self.publish(&key.kind, WatchEventType::Deleted, removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, kind: &ResourceKind, query: &StateQuery) -> Result<Vec<Resource>> {
        let state = self.state.lock();
        Ok(state
            .resources
            .iter()
            .filter(|(key, r)| key.kind == *kind && query.matches(r.state()))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn watch(&self, kind: &ResourceKind, query: &StateQuery) -> Result<WatchStream> {
        if Self::take_injected(&self.rejected_watches) {
            return Err(Error::unavailable("store", "watch registration rejected"));
        }

        // Subscribe and snapshot under the same lock so no write falls between them
        let (receiver, initial) = {
            let state = self.state.lock();
            let receiver = self.events.subscribe();
            let initial: Vec<Result<WatchEvent>> = state
                .resources
                .iter()
                .filter(|(key, r)| key.kind == *kind && query.matches(r.state()))
                .map(|(_, r)| {
                    Ok(WatchEvent {
                        event_type: WatchEventType::Added,
                        object: r.clone(),
                    })
                })
                .collect();
            (receiver, initial)
        };
        self.watch_registrations.fetch_add(1, Ordering::SeqCst);

        let kind = kind.clone();
        let query = query.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok((event_kind, event)) => {
                    if event_kind == kind && query.matches(event.object.state()) {
                        Some(Ok(event))
                    } else {
                        None
                    }
                }
                Err(e) => Some(Err(Error::unavailable("store", format!("watch lagged: {e}")))),
            };
            futures::future::ready(item)
        });

        Ok(futures::stream::iter(initial).chain(live).boxed())
    }
}
