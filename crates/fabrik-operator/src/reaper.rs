//! Stale-lock reaper
//!
//! Deployment lock records are supposed to be unlocked by the operation that
//! took them. When that does not happen (crash, lost update) the reaper
//! notices: it polls every locked record and unlocks it once the operation it
//! references has finished or disappeared.
//!
//! | referenced resource | lock age | action                          |
//! |---------------------|----------|---------------------------------|
//! | terminal            | any      | unlock, stop polling            |
//! | not terminal        | < TTL    | keep polling                    |
//! | not terminal        | >= TTL   | stop polling (unlock if forced) |
//! | not found           | any      | unlock, stop polling            |
//!
//! Unlocking is conditional on the record version that was checked, so a lock
//! taken after that check is never released by a late tick.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use fabrik_common::config::FabrikConfig;
use fabrik_common::resource::{Resource, ResourceKey, ResourceState, StateQuery};
use fabrik_common::store::ResourceStore;
use fabrik_common::Result;

use crate::lock::{DeploymentLockDetails, DeploymentLocks};
use crate::poller::{PollStatus, PollerConfig, ReconciliationPoller, StatusSource};

/// Status source deciding whether a lock record is stale
pub struct LockRecordStatus {
    store: Arc<dyn ResourceStore>,
    locks: DeploymentLocks,
    force_unlock_expired: bool,
}

impl LockRecordStatus {
    /// Create the status source
    pub fn new(store: Arc<dyn ResourceStore>, locks: DeploymentLocks, force_unlock_expired: bool) -> Self {
        Self {
            store,
            locks,
            force_unlock_expired,
        }
    }

    /// Unlock the checked record; a record that changed since is judged
    /// again on the next tick
    async fn unlock(&self, record: &Resource) -> Result<PollStatus> {
        if self.locks.unlock_observed(record).await? {
            Ok(PollStatus::Terminal)
        } else {
            Ok(PollStatus::Pending)
        }
    }
}

#[async_trait]
impl StatusSource for LockRecordStatus {
    async fn poll_status(&self, key: &ResourceKey, record: &Resource) -> Result<PollStatus> {
        let details = DeploymentLockDetails::from_resource(record)?;
        let operation = &details.locked_resource_details;
        let target = operation.key();

        let referenced = self.store.get(&target).await?;
        let state = match referenced.as_ref() {
            None => {
                info!(
                    lock = %key,
                    target = %target,
                    "Locked resource no longer exists, unlocking"
                );
                return self.unlock(record).await;
            }
            Some(resource) => resource.state(),
        };

        if state.is_terminal() {
            info!(
                lock = %key,
                target = %target,
                state = %state,
                operation = %operation.operation,
                "Locked operation finished, unlocking"
            );
            return self.unlock(record).await;
        }

        if !details.is_expired(self.locks.settings(), Utc::now()) {
            return Ok(PollStatus::Pending);
        }

        if self.force_unlock_expired {
            warn!(
                lock = %key,
                target = %target,
                state = %state,
                "Lock outlived its TTL, force unlocking"
            );
            return self.unlock(record).await;
        }
        warn!(
            lock = %key,
            target = %target,
            state = %state,
            "Lock outlived its TTL while operation is still running, no longer polling"
        );
        Ok(PollStatus::Terminal)
    }
}

/// Reconciliation poller over deployment lock records
pub struct StaleLockReaper {
    poller: ReconciliationPoller,
}

impl StaleLockReaper {
    /// Create a reaper from the operator configuration
    pub fn new(store: Arc<dyn ResourceStore>, config: &FabrikConfig, identity: &str) -> Self {
        let locks = DeploymentLocks::new(store.clone(), config.locks.clone());
        let status = LockRecordStatus::new(store.clone(), locks, config.locks.force_unlock_expired);
        let poller_config = PollerConfig::new(
            DeploymentLocks::kind(),
            StateQuery::NotIn(vec![ResourceState::Unlocked]),
            config.pollers.unlock_poll_interval(),
            config,
            identity,
        );
        Self {
            poller: ReconciliationPoller::new(store, Arc::new(status), poller_config),
        }
    }

    /// Start watching lock records
    pub fn start(&self) {
        self.poller.start();
    }

    /// Stop watching and polling
    pub fn shutdown(&self) {
        self.poller.shutdown();
    }

    /// Underlying poller
    pub fn poller(&self) -> &ReconciliationPoller {
        &self.poller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockType, LockedResourceDetails};
    use fabrik_common::config::LockSettings;
    use fabrik_common::memory::InMemoryStore;
    use fabrik_common::resource::{NewResource, ResourceKind};
    use serde_json::json;
    use std::time::Duration;

    fn backups() -> ResourceKind {
        ResourceKind::new("backup", "defaultbackups")
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        locks: DeploymentLocks,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let locks = DeploymentLocks::new(store.clone(), LockSettings::default());
            Self { store, locks }
        }

        async fn backup(&self, id: &str, state: ResourceState) {
            self.store
                .create(&backups(), NewResource::new(id, json!({}), state))
                .await
                .unwrap();
        }

        async fn lock(&self, instance: &str, backup: &str, ttl: Option<Duration>) -> Resource {
            let details = LockedResourceDetails::new(&backups().key(backup), "backup");
            self.locks
                .lock_deployment(instance, LockType::Write, details, ttl)
                .await
                .unwrap()
        }

        async fn check(&self, instance: &str, force: bool) -> PollStatus {
            let status = LockRecordStatus::new(self.store.clone(), self.locks.clone(), force);
            let key = DeploymentLocks::kind().key(instance);
            let record = self.store.get(&key).await.unwrap().unwrap();
            status.poll_status(&key, &record).await.unwrap()
        }

        async fn record_state(&self, instance: &str) -> ResourceState {
            self.store
                .get(&DeploymentLocks::kind().key(instance))
                .await
                .unwrap()
                .unwrap()
                .state()
        }
    }

    #[tokio::test]
    async fn terminal_operation_unlocks() {
        for state in [
            ResourceState::Succeeded,
            ResourceState::Failed,
            ResourceState::DeleteFailed,
            ResourceState::Aborted,
        ] {
            let fx = Fixture::new();
            fx.backup("b-1", state).await;
            fx.lock("i-1", "b-1", None).await;

            assert_eq!(fx.check("i-1", false).await, PollStatus::Terminal);
            assert_eq!(fx.record_state("i-1").await, ResourceState::Unlocked);
        }
    }

    #[tokio::test]
    async fn running_operation_within_ttl_keeps_polling() {
        let fx = Fixture::new();
        fx.backup("b-1", ResourceState::InProgress).await;
        fx.lock("i-1", "b-1", None).await;

        assert_eq!(fx.check("i-1", false).await, PollStatus::Pending);
        assert_eq!(fx.record_state("i-1").await, ResourceState::Locked);
    }

    #[tokio::test]
    async fn aged_out_lock_stops_polling_and_stays_locked() {
        let fx = Fixture::new();
        fx.backup("b-1", ResourceState::InProgress).await;
        fx.lock("i-1", "b-1", Some(Duration::ZERO)).await;

        assert_eq!(fx.check("i-1", false).await, PollStatus::Terminal);
        assert_eq!(fx.record_state("i-1").await, ResourceState::Locked);
    }

    #[tokio::test]
    async fn aged_out_lock_is_unlocked_when_forced() {
        let fx = Fixture::new();
        fx.backup("b-1", ResourceState::InProgress).await;
        fx.lock("i-1", "b-1", Some(Duration::ZERO)).await;

        assert_eq!(fx.check("i-1", true).await, PollStatus::Terminal);
        assert_eq!(fx.record_state("i-1").await, ResourceState::Unlocked);
    }

    #[tokio::test]
    async fn missing_operation_unlocks() {
        let fx = Fixture::new();
        fx.lock("i-1", "never-created", None).await;

        assert_eq!(fx.check("i-1", false).await, PollStatus::Terminal);
        assert_eq!(fx.record_state("i-1").await, ResourceState::Unlocked);
    }

    #[tokio::test]
    async fn late_tick_does_not_release_a_newer_lock() {
        let fx = Fixture::new();
        fx.backup("b-1", ResourceState::Succeeded).await;
        fx.backup("b-2", ResourceState::InProgress).await;

        let finished = fx.lock("i-1", "b-1", None).await;
        fx.locks.unlock_deployment("i-1").await.unwrap();
        fx.lock("i-1", "b-2", None).await;

        let status = LockRecordStatus::new(fx.store.clone(), fx.locks.clone(), false);
        let key = DeploymentLocks::kind().key("i-1");
        assert_eq!(
            status.poll_status(&key, &finished).await.unwrap(),
            PollStatus::Pending
        );
        assert!(fx.locks.is_write_locked("i-1").await.unwrap());

        // Judged on the current record, the running backup keeps it locked
        assert_eq!(fx.check("i-1", false).await, PollStatus::Pending);
        assert_eq!(fx.record_state("i-1").await, ResourceState::Locked);
    }

    #[tokio::test]
    async fn unreadable_record_is_an_error() {
        let fx = Fixture::new();
        let record = fx
            .store
            .create(
                &DeploymentLocks::kind(),
                NewResource::new("i-1", json!({"lockType": 42}), ResourceState::Locked),
            )
            .await
            .unwrap();

        let status = LockRecordStatus::new(fx.store.clone(), fx.locks.clone(), false);
        let key = DeploymentLocks::kind().key("i-1");
        assert!(status.poll_status(&key, &record).await.is_err());
    }
}
