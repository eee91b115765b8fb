//! Generic reconciliation poller
//!
//! A [`ReconciliationPoller`] watches one resource kind. When an accepted
//! event arrives for a resource in an accepted state it starts a local timer
//! for that resource (at most one per id). Every tick the poller claims the
//! resource through its poller lock annotation, re-checks the fresh state and
//! asks the [`StatusSource`] whether the operation behind it has finished.
//!
//! Per resource:
//!
//! ```text
//! Idle --accepted event--> Polling --tick: claim conflict / Pending--> Polling
//!                            |
//!                            +--tick: Terminal / state left the filter / resource gone--> Idle
//!                            +--tick: status error (fail closed)--> Idle
//! ```
//!
//! Cross-process exclusivity comes only from the lock annotation; the
//! [`PollRegistry`] deduplicates timers within this process. The claim TTL
//! is the poll interval plus a relaxation time, so a crashed poller's
//! resources are picked up by others after one missed tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fabrik_common::config::FabrikConfig;
use fabrik_common::resource::{
    Resource, ResourceKey, ResourceKind, StateQuery, WatchEvent, WatchEventType,
};
use fabrik_common::store::ResourceStore;
use fabrik_common::Result;

use crate::lock::{AcquireOutcome, LockManager, LockedResourceDetails, POLLER_LOCK_ANNOTATION};
use crate::watch::{spawn_watch_loop, WatchConfig};

/// Operation name recorded in poller lock annotations
const POLL_OPERATION: &str = "poll";

/// Status of the operation behind a polled resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Still running; poll again next tick
    Pending,
    /// Finished; stop polling
    Terminal,
}

/// Operation-specific status check run on every tick
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Inspect the operation behind `resource` (already claimed by this
    /// poller) and report whether it finished. May write the outcome back.
    async fn poll_status(&self, key: &ResourceKey, resource: &Resource) -> Result<PollStatus>;
}

/// Poller parameters
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Resource kind to watch
    pub kind: ResourceKind,
    /// States that start (and keep) a resource polling
    pub accepted_states: StateQuery,
    /// Watch event types that may start polling
    pub event_types: Vec<WatchEventType>,
    /// Interval between ticks
    pub poll_interval: Duration,
    /// Grace added to the claim TTL
    pub relaxation: Duration,
    /// Watch timing
    pub watch: WatchConfig,
    /// Identity written into claims
    pub identity: String,
}

impl PollerConfig {
    /// Poller over `kind` with timing taken from the operator configuration
    pub fn new(
        kind: ResourceKind,
        accepted_states: StateQuery,
        poll_interval: Duration,
        config: &FabrikConfig,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            accepted_states,
            event_types: vec![WatchEventType::Added, WatchEventType::Modified],
            poll_interval,
            relaxation: config.pollers.relaxation(),
            watch: WatchConfig::from(&config.pollers),
            identity: identity.into(),
        }
    }

    /// Claim TTL: one interval plus relaxation
    pub fn claim_ttl(&self) -> Duration {
        self.poll_interval + self.relaxation
    }
}

/// Active local timers, keyed by resource id
///
/// Each entry carries a generation so a finishing timer never removes an
/// entry that was re-registered after it was cancelled.
#[derive(Default)]
pub struct PollRegistry {
    active: DashMap<String, (u64, CancellationToken)>,
    next_generation: AtomicU64,
}

impl PollRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer for `id`; `None` if one is already active
    pub fn try_register(&self, id: &str) -> Option<(u64, CancellationToken)> {
        match self.active.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                slot.insert((generation, token.clone()));
                Some((generation, token))
            }
        }
    }

    /// Remove the entry for `id` if it still belongs to `generation`
    pub fn unregister(&self, id: &str, generation: u64) {
        self.active.remove_if(id, |_, (g, _)| *g == generation);
    }

    /// Cancel and remove the timer for `id`
    pub fn cancel(&self, id: &str) -> bool {
        match self.active.remove(id) {
            Some((_, (_, token))) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer
    pub fn cancel_all(&self) {
        let count = self.active.len();
        if count > 0 {
            info!(count = count, "Cancelling all active pollers");
        }
        self.active.retain(|_, (_, token)| {
            token.cancel();
            false
        });
    }

    /// True if a timer is active for `id`
    pub fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// Ids with an active timer
    pub fn ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of active timers
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True if no timers are active
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// What a tick decided
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tick {
    Continue,
    Stop,
}

struct PollerInner {
    store: Arc<dyn ResourceStore>,
    status: Arc<dyn StatusSource>,
    config: PollerConfig,
    lock: LockManager,
    registry: PollRegistry,
}

/// Watch-driven poller for one resource kind
pub struct ReconciliationPoller {
    inner: Arc<PollerInner>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl ReconciliationPoller {
    /// Create a poller; nothing runs until [`ReconciliationPoller::start`]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        status: Arc<dyn StatusSource>,
        config: PollerConfig,
    ) -> Self {
        let lock = LockManager::new(
            store.clone(),
            POLLER_LOCK_ANNOTATION,
            config.identity.clone(),
            config.claim_ttl(),
        );
        Self {
            inner: Arc::new(PollerInner {
                store,
                status,
                config,
                lock,
                registry: PollRegistry::new(),
            }),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start consuming the watch; later calls are no-ops
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        info!(kind = %inner.config.kind, "Starting reconciliation poller");
        spawn_watch_loop(
            inner.store.clone(),
            inner.config.kind.clone(),
            inner.config.accepted_states.clone(),
            inner.config.watch,
            self.shutdown.child_token(),
            move |event| inner.clone().on_event(event),
        );
    }

    /// Stop polling a resource locally; the claim on the server ages out
    pub fn clear_poller(&self, id: &str) -> bool {
        let cleared = self.inner.registry.cancel(id);
        if cleared {
            info!(kind = %self.inner.config.kind, resource = %id, "Poller cleared");
        }
        cleared
    }

    /// Stop the watch loop and every timer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.inner.registry.cancel_all();
    }

    /// True while a timer is active for `id`
    pub fn is_polling(&self, id: &str) -> bool {
        self.inner.registry.contains(id)
    }

    /// Ids currently polled by this instance
    pub fn active_pollers(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    /// Kind this poller watches
    pub fn kind(&self) -> &ResourceKind {
        &self.inner.config.kind
    }
}

impl Drop for ReconciliationPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PollerInner {
    fn on_event(self: Arc<Self>, event: WatchEvent) {
        let resource = &event.object;
        if !self.config.event_types.contains(&event.event_type)
            || !self.config.accepted_states.matches(resource.state())
        {
            return;
        }
        // Our own claim writes come back as events; the running timer covers them
        if self.lock.holds(resource) {
            return;
        }

        let id = resource.id().to_string();
        let Some((generation, token)) = self.registry.try_register(&id) else {
            debug!(resource = %id, event = %event.event_type, "Already polling, ignoring event");
            return;
        };
        debug!(
            kind = %self.config.kind,
            resource = %id,
            state = %resource.state(),
            "Starting poller"
        );
        tokio::spawn(self.poll(id, generation, token));
    }

    async fn poll(self: Arc<Self>, id: String, generation: u64, token: CancellationToken) {
        let key = self.config.kind.key(id.clone());
        let period = self.config.poll_interval;
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticks.tick() => {
                    if self.tick(&key).await == Tick::Stop {
                        break;
                    }
                }
            }
        }

        self.registry.unregister(&id, generation);
        debug!(resource = %key, "Poller stopped");
    }

    async fn tick(&self, key: &ResourceKey) -> Tick {
        let details = LockedResourceDetails::new(key, POLL_OPERATION);
        let resource = match self.lock.acquire(key, details).await {
            Ok(AcquireOutcome::Acquired(resource)) => resource,
            Ok(AcquireOutcome::Conflict { holder }) => {
                debug!(resource = %key, holder = ?holder, "Claimed elsewhere, skipping tick");
                return Tick::Continue;
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %key, "Resource gone, stopping poller");
                return Tick::Stop;
            }
            Err(e) => {
                warn!(resource = %key, error = %e, "Failed to claim resource, retrying next tick");
                return Tick::Continue;
            }
        };

        if !self.config.accepted_states.matches(resource.state()) {
            debug!(
                resource = %key,
                state = %resource.state(),
                "State no longer polled, stopping poller"
            );
            return Tick::Stop;
        }

        match self.status.poll_status(key, &resource).await {
            Ok(PollStatus::Pending) => Tick::Continue,
            Ok(PollStatus::Terminal) => {
                info!(resource = %key, "Operation finished, stopping poller");
                Tick::Stop
            }
            Err(e) => {
                error!(resource = %key, error = %e, "Status check failed, stopping poller");
                Tick::Stop
            }
        }
    }
}
