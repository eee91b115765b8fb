//! Distributed locks on Fabrik resources
//!
//! Two kinds of locks live in the resource store:
//!
//! - **Annotation locks** ([`LockManager`]): a JSON annotation on the target
//!   resource naming the owner. Pollers use one to claim a resource for a
//!   tick; operators use another while processing a request.
//! - **Deployment lock records** ([`DeploymentLocks`]): one `lock/deploymentlocks`
//!   resource per service instance, held for the duration of long operations
//!   such as backup or restore.
//!
//! Both are written only through conditional patches against the version
//! that was just read, so of several racing writers exactly one wins. Locks
//! carry their wall-clock acquisition time; a lock older than its TTL may be
//! taken over without an explicit release.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fabrik_common::config::LockSettings;
use fabrik_common::resource::{
    NewResource, Resource, ResourceKey, ResourceKind, ResourcePatch, ResourceState, ResourceStatus,
};
use fabrik_common::retry::{retry_with_backoff, RetryConfig};
use fabrik_common::store::{CasResult, ResourceStore};
use fabrik_common::{Error, Result, DEPLOYMENT_LOCKS_TYPE, LOCK_RESOURCE_GROUP};

use crate::error::LockError;

/// Annotation claimed by reconciliation pollers
pub const POLLER_LOCK_ANNOTATION: &str = "lockedByTaskPoller";

/// Annotation claimed by operators while processing a request
pub const PROCESSING_LOCK_ANNOTATION: &str = "lockedByManager";

/// Attempts at taking a deployment lock before giving up on a record that
/// keeps changing underneath us
const LOCK_ATTEMPTS: usize = 3;

/// Resource an operation is acting on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedResourceDetails {
    /// Resource group
    pub group: String,
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource id
    pub id: String,
    /// Operation the lock is held for
    pub operation: String,
}

impl LockedResourceDetails {
    /// Details for an operation on `key`
    pub fn new(key: &ResourceKey, operation: impl Into<String>) -> Self {
        Self {
            group: key.kind.group.clone(),
            resource_type: key.kind.resource_type.clone(),
            id: key.id.clone(),
            operation: operation.into(),
        }
    }

    /// Key of the referenced resource
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.group, &self.resource_type, &self.id)
    }
}

/// Content of a lock annotation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAnnotation {
    /// Process holding the lock
    pub owner_identity: String,
    /// What the lock was taken for
    pub locked_resource_details: LockedResourceDetails,
    /// When the lock was (last) written
    pub lock_time: DateTime<Utc>,
}

impl LockAnnotation {
    /// True once the lock is older than `ttl`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        lock_age(self.lock_time, now) >= ttl
    }
}

/// Time since a lock was written; zero for clocks that ran backwards
pub fn lock_age(lock_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - lock_time).to_std().unwrap_or_default()
}

/// Outcome of a lock acquisition
#[derive(Clone, Debug, PartialEq)]
pub enum AcquireOutcome {
    /// Lock written; carries the resource at its new version
    Acquired(Resource),
    /// Someone else holds the lock or won the race
    Conflict {
        /// Current holder, when known
        holder: Option<String>,
    },
}

impl AcquireOutcome {
    /// Returns true if the lock was acquired
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Outcome of a lock release; every variant is a successful release
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Annotation removed
    Released,
    /// No lock was present
    AlreadyReleased,
    /// The resource no longer exists
    Gone,
    /// Another owner holds the lock now, or the resource changed underneath us
    Superseded,
}

/// Annotation lock held under one annotation key by one identity
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ResourceStore>,
    annotation: String,
    identity: String,
    ttl: Duration,
}

impl LockManager {
    /// Create a lock manager writing `annotation` as `identity`; locks older
    /// than `ttl` may be taken over
    pub fn new(
        store: Arc<dyn ResourceStore>,
        annotation: impl Into<String>,
        identity: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            annotation: annotation.into(),
            identity: identity.into(),
            ttl,
        }
    }

    /// Identity written into acquired locks
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Lock TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Parsed lock annotation on a resource; malformed values count as absent
    pub fn current_lock(&self, resource: &Resource) -> Option<LockAnnotation> {
        let raw = resource.annotation(&self.annotation)?;
        match serde_json::from_str(raw) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!(
                    resource = %resource.id(),
                    annotation = %self.annotation,
                    error = %e,
                    "Ignoring malformed lock annotation"
                );
                None
            }
        }
    }

    /// True if `resource` carries an unexpired lock written by this identity
    pub fn holds(&self, resource: &Resource) -> bool {
        self.current_lock(resource).is_some_and(|lock| {
            lock.owner_identity == self.identity && !lock.is_expired(self.ttl, Utc::now())
        })
    }

    /// Acquire the lock on `target`, reading its current version first
    ///
    /// Fails with [`Error::NotFound`] if the resource does not exist.
    pub async fn acquire(
        &self,
        target: &ResourceKey,
        details: LockedResourceDetails,
    ) -> Result<AcquireOutcome> {
        let resource = self
            .store
            .get(target)
            .await?
            .ok_or_else(|| Error::not_found(target.to_string()))?;
        self.acquire_observed(target, &resource, details).await
    }

    /// Acquire the lock against an already-read version of `target`
    pub async fn acquire_observed(
        &self,
        target: &ResourceKey,
        observed: &Resource,
        details: LockedResourceDetails,
    ) -> Result<AcquireOutcome> {
        let now = Utc::now();
        if let Some(lock) = self.current_lock(observed) {
            if lock.owner_identity != self.identity && !lock.is_expired(self.ttl, now) {
                debug!(
                    resource = %target,
                    holder = %lock.owner_identity,
                    "Lock held by another owner"
                );
                return Ok(AcquireOutcome::Conflict {
                    holder: Some(lock.owner_identity),
                });
            }
        }

        let lock = LockAnnotation {
            owner_identity: self.identity.clone(),
            locked_resource_details: details,
            lock_time: now,
        };
        let patch = ResourcePatch::new()
            .set_annotation(self.annotation.clone(), serde_json::to_string(&lock)?);

        match self
            .store
            .patch(target, &patch, Some(observed.version()))
            .await?
        {
            CasResult::Applied(resource) => {
                debug!(resource = %target, owner = %self.identity, "Lock acquired");
                Ok(AcquireOutcome::Acquired(resource))
            }
            CasResult::Conflict { .. } => {
                debug!(resource = %target, "Lost lock race");
                Ok(AcquireOutcome::Conflict { holder: None })
            }
            CasResult::NotFound => Err(Error::not_found(target.to_string())),
        }
    }

    /// Release the lock on `target`; never fails on a missing or
    /// concurrently modified resource
    ///
    /// Unrelated writes racing the release are retried as long as the lock
    /// is still ours.
    pub async fn release(&self, target: &ResourceKey) -> Result<ReleaseOutcome> {
        let patch = ResourcePatch::new().remove_annotation(self.annotation.clone());
        for _ in 0..LOCK_ATTEMPTS {
            let Some(resource) = self.store.get(target).await? else {
                return Ok(ReleaseOutcome::Gone);
            };
            match self.current_lock(&resource) {
                None => return Ok(ReleaseOutcome::AlreadyReleased),
                Some(lock) if lock.owner_identity != self.identity => {
                    debug!(
                        resource = %target,
                        holder = %lock.owner_identity,
                        "Lock taken over by another owner, not releasing"
                    );
                    return Ok(ReleaseOutcome::Superseded);
                }
                Some(_) => {}
            }

            match self
                .store
                .patch(target, &patch, Some(resource.version()))
                .await?
            {
                CasResult::Applied(_) => {
                    debug!(resource = %target, "Lock released");
                    return Ok(ReleaseOutcome::Released);
                }
                CasResult::Conflict { .. } => continue,
                CasResult::NotFound => return Ok(ReleaseOutcome::Gone),
            }
        }
        debug!(resource = %target, "Resource kept changing, leaving lock to expire");
        Ok(ReleaseOutcome::Superseded)
    }
}

/// Kind of a deployment lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Shared lock
    Read,
    /// Exclusive lock; blocks updates to the deployment
    Write,
}

/// Spec of a deployment lock record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLockDetails {
    /// Read or write lock
    pub lock_type: LockType,
    /// When the lock was taken
    pub lock_time: DateTime<Utc>,
    /// Lifetime in seconds, overriding the configured per-operation TTL
    #[serde(rename = "lockTTL", default, skip_serializing_if = "Option::is_none")]
    pub lock_ttl: Option<u64>,
    /// Operation holding the lock
    pub locked_resource_details: LockedResourceDetails,
}

impl DeploymentLockDetails {
    /// Parse the details stored in a lock record
    pub fn from_resource(resource: &Resource) -> Result<Self> {
        resource.spec_as()
    }

    /// Lifetime of this lock
    pub fn ttl(&self, settings: &LockSettings) -> Duration {
        match self.lock_ttl {
            Some(secs) => Duration::from_secs(secs),
            None => settings.ttl_for(&self.locked_resource_details.operation),
        }
    }

    /// True once the lock outlived its TTL
    pub fn is_expired(&self, settings: &LockSettings, now: DateTime<Utc>) -> bool {
        lock_age(self.lock_time, now) >= self.ttl(settings)
    }
}

/// Deployment lock records (`lock/deploymentlocks/<instance id>`)
#[derive(Clone)]
pub struct DeploymentLocks {
    store: Arc<dyn ResourceStore>,
    settings: LockSettings,
    unlock_retry: RetryConfig,
}

impl DeploymentLocks {
    /// Create the lock API over a store
    pub fn new(store: Arc<dyn ResourceStore>, settings: LockSettings) -> Self {
        Self {
            store,
            settings,
            unlock_retry: RetryConfig::fixed(5, Duration::from_secs(1)),
        }
    }

    /// Override the retry schedule used when unlocking
    pub fn with_unlock_retry(mut self, retry: RetryConfig) -> Self {
        self.unlock_retry = retry;
        self
    }

    /// Kind of deployment lock records
    pub fn kind() -> ResourceKind {
        ResourceKind::new(LOCK_RESOURCE_GROUP, DEPLOYMENT_LOCKS_TYPE)
    }

    /// Lock settings in effect
    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Lock a deployment for an operation
    ///
    /// Fails with [`LockError::Locked`] while another unexpired lock is held.
    /// An unlocked or expired record is taken over.
    pub async fn lock_deployment(
        &self,
        instance_id: &str,
        lock_type: LockType,
        details: LockedResourceDetails,
        ttl: Option<Duration>,
    ) -> std::result::Result<Resource, LockError> {
        let key = Self::kind().key(instance_id);

        for _ in 0..LOCK_ATTEMPTS {
            let now = Utc::now();
            let spec = serde_json::to_value(DeploymentLockDetails {
                lock_type,
                lock_time: now,
                lock_ttl: ttl.map(|t| t.as_secs()),
                locked_resource_details: details.clone(),
            })
            .map_err(Error::from)?;

            let Some(existing) = self.store.get(&key).await? else {
                let record = NewResource::new(instance_id, spec, ResourceState::Locked);
                match self.store.create(&Self::kind(), record).await {
                    Ok(created) => {
                        info!(
                            instance = %instance_id,
                            operation = %details.operation,
                            "Deployment locked"
                        );
                        return Ok(created);
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            };

            if existing.state() == ResourceState::Locked {
                match DeploymentLockDetails::from_resource(&existing) {
                    Ok(current) if !current.is_expired(&self.settings, now) => {
                        return Err(LockError::Locked {
                            operation: current.locked_resource_details.operation,
                            resource: instance_id.to_string(),
                        });
                    }
                    Ok(current) => {
                        warn!(
                            instance = %instance_id,
                            operation = %current.locked_resource_details.operation,
                            "Taking over expired deployment lock"
                        );
                    }
                    Err(e) => {
                        warn!(instance = %instance_id, error = %e, "Taking over unreadable deployment lock");
                    }
                }
            }

            let patch = ResourcePatch::new()
                .with_spec(spec)
                .with_status(ResourceStatus::with_state(ResourceState::Locked));
            match self
                .store
                .patch(&key, &patch, Some(existing.version()))
                .await?
            {
                CasResult::Applied(locked) => {
                    info!(
                        instance = %instance_id,
                        operation = %details.operation,
                        "Deployment locked"
                    );
                    return Ok(locked);
                }
                CasResult::Conflict { .. } | CasResult::NotFound => continue,
            }
        }

        Err(Error::conflict(key.to_string(), "lock record changed on every attempt").into())
    }

    /// Unlock a deployment; a missing or concurrently changed record counts
    /// as unlocked. Transport failures are retried.
    pub async fn unlock_deployment(&self, instance_id: &str) -> Result<()> {
        let key = Self::kind().key(instance_id);
        retry_with_backoff(&self.unlock_retry, "unlock deployment", || {
            self.try_unlock(&key)
        })
        .await
    }

    async fn try_unlock(&self, key: &ResourceKey) -> Result<()> {
        let Some(record) = self.store.get(key).await? else {
            debug!(resource = %key, "Lock record gone, nothing to unlock");
            return Ok(());
        };
        if record.state() == ResourceState::Unlocked {
            return Ok(());
        }

        let patch =
            ResourcePatch::new().with_status(ResourceStatus::with_state(ResourceState::Unlocked));
        match self
            .store
            .patch(key, &patch, Some(record.version()))
            .await?
        {
            CasResult::Applied(_) => info!(resource = %key, "Deployment unlocked"),
            CasResult::Conflict { .. } => {
                debug!(resource = %key, "Lock record changed concurrently, treating as unlocked")
            }
            CasResult::NotFound => debug!(resource = %key, "Lock record deleted while unlocking"),
        }
        Ok(())
    }

    /// Unlock the exact lock in `record`, as read by the caller
    ///
    /// Returns false when the record changed since it was read: the decision
    /// to unlock was made about a lock that may no longer be the one stored,
    /// so a newer lock is left alone. Transport failures are retried.
    pub async fn unlock_observed(&self, record: &Resource) -> Result<bool> {
        let key = Self::kind().key(record.id());
        let patch =
            ResourcePatch::new().with_status(ResourceStatus::with_state(ResourceState::Unlocked));
        let outcome = retry_with_backoff(&self.unlock_retry, "unlock deployment", || {
            self.store.patch(&key, &patch, Some(record.version()))
        })
        .await?;

        Ok(match outcome {
            CasResult::Applied(_) => {
                info!(resource = %key, "Deployment unlocked");
                true
            }
            CasResult::Conflict { .. } => {
                debug!(resource = %key, "Lock record changed since it was checked, leaving it");
                false
            }
            CasResult::NotFound => {
                debug!(resource = %key, "Lock record deleted before unlocking");
                true
            }
        })
    }

    /// True while an unexpired write lock is held on the deployment
    pub async fn is_write_locked(&self, instance_id: &str) -> Result<bool> {
        let Some(record) = self.store.get(&Self::kind().key(instance_id)).await? else {
            return Ok(false);
        };
        if record.state() != ResourceState::Locked {
            return Ok(false);
        }
        Ok(match DeploymentLockDetails::from_resource(&record) {
            Ok(details) => {
                details.lock_type == LockType::Write
                    && !details.is_expired(&self.settings, Utc::now())
            }
            Err(_) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_common::memory::InMemoryStore;
    use serde_json::json;

    fn directors() -> ResourceKind {
        ResourceKind::new("deployment", "directors")
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .create(
                &directors(),
                NewResource::new("d-1", json!({}), ResourceState::InQueue),
            )
            .await
            .unwrap();
        store
    }

    fn manager(store: &Arc<InMemoryStore>, identity: &str, ttl: Duration) -> LockManager {
        LockManager::new(store.clone(), PROCESSING_LOCK_ANNOTATION, identity, ttl)
    }

    fn details(operation: &str) -> LockedResourceDetails {
        LockedResourceDetails::new(&directors().key("d-1"), operation)
    }

    #[tokio::test]
    async fn concurrent_acquires_on_same_version_have_one_winner() {
        let store = seeded_store().await;
        let key = directors().key("d-1");
        let observed = store.get(&key).await.unwrap().unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = manager(&store, &format!("broker-{i}"), Duration::from_secs(300));
            let key = key.clone();
            let observed = observed.clone();
            handles.push(tokio::spawn(async move {
                lock.acquire_observed(&key, &observed, details("create"))
                    .await
                    .unwrap()
            }));
        }

        let mut acquired = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                AcquireOutcome::Acquired(_) => acquired += 1,
                AcquireOutcome::Conflict { .. } => conflicts += 1,
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn held_lock_reports_holder_until_expired() {
        let store = seeded_store().await;
        let key = directors().key("d-1");

        let a = manager(&store, "broker-a", Duration::from_secs(300));
        assert!(a.acquire(&key, details("create")).await.unwrap().is_acquired());

        let b = manager(&store, "broker-b", Duration::from_secs(300));
        assert_eq!(
            b.acquire(&key, details("create")).await.unwrap(),
            AcquireOutcome::Conflict {
                holder: Some("broker-a".to_string())
            }
        );

        // With a zero TTL every existing lock counts as expired
        let c = manager(&store, "broker-c", Duration::ZERO);
        let AcquireOutcome::Acquired(resource) = c.acquire(&key, details("create")).await.unwrap()
        else {
            panic!("expired lock must be taken over");
        };
        assert_eq!(c.current_lock(&resource).unwrap().owner_identity, "broker-c");
    }

    #[tokio::test]
    async fn owner_can_reacquire_its_own_lock() {
        let store = seeded_store().await;
        let key = directors().key("d-1");
        let a = manager(&store, "broker-a", Duration::from_secs(300));

        assert!(a.acquire(&key, details("poll")).await.unwrap().is_acquired());
        let AcquireOutcome::Acquired(resource) = a.acquire(&key, details("poll")).await.unwrap()
        else {
            panic!("owner must be able to refresh its lock");
        };
        assert!(a.holds(&resource));
    }

    #[tokio::test]
    async fn acquire_on_missing_resource_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let a = manager(&store, "broker-a", Duration::from_secs(300));
        let err = a
            .acquire(&directors().key("missing"), details("create"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = seeded_store().await;
        let key = directors().key("d-1");
        let a = manager(&store, "broker-a", Duration::from_secs(300));

        assert_eq!(a.release(&key).await.unwrap(), ReleaseOutcome::AlreadyReleased);
        a.acquire(&key, details("create")).await.unwrap();
        assert_eq!(a.release(&key).await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(a.release(&key).await.unwrap(), ReleaseOutcome::AlreadyReleased);

        store.delete(&key).await.unwrap();
        assert_eq!(a.release(&key).await.unwrap(), ReleaseOutcome::Gone);
    }

    #[tokio::test]
    async fn release_leaves_other_owners_lock_in_place() {
        let store = seeded_store().await;
        let key = directors().key("d-1");
        let a = manager(&store, "broker-a", Duration::from_secs(300));
        let b = manager(&store, "broker-b", Duration::from_secs(300));

        a.acquire(&key, details("create")).await.unwrap();
        assert_eq!(b.release(&key).await.unwrap(), ReleaseOutcome::Superseded);

        let resource = store.get(&key).await.unwrap().unwrap();
        assert!(a.holds(&resource));
    }

    fn locks(store: &Arc<InMemoryStore>) -> DeploymentLocks {
        DeploymentLocks::new(store.clone(), LockSettings::default())
            .with_unlock_retry(RetryConfig::fixed(3, Duration::from_millis(1)))
    }

    fn backup_details(instance: &str) -> LockedResourceDetails {
        LockedResourceDetails::new(&ResourceKey::new("backup", "defaultbackups", instance), "backup")
    }

    #[tokio::test]
    async fn deployment_lock_blocks_second_operation() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(&store);

        let record = locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-1"), None)
            .await
            .unwrap();
        assert_eq!(record.state(), ResourceState::Locked);
        assert!(locks.is_write_locked("i-1").await.unwrap());

        let err = locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-2"), None)
            .await
            .unwrap_err();
        match err {
            LockError::Locked {
                operation,
                resource,
            } => {
                assert_eq!(operation, "backup");
                assert_eq!(resource, "i-1");
            }
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unlocked_and_expired_records_are_taken_over() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(&store);

        locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-1"), None)
            .await
            .unwrap();
        locks.unlock_deployment("i-1").await.unwrap();
        assert!(!locks.is_write_locked("i-1").await.unwrap());

        // A zero TTL expires immediately
        locks
            .lock_deployment(
                "i-1",
                LockType::Write,
                backup_details("b-2"),
                Some(Duration::ZERO),
            )
            .await
            .unwrap();
        assert!(!locks.is_write_locked("i-1").await.unwrap());

        let record = locks
            .lock_deployment("i-1", LockType::Read, backup_details("b-3"), None)
            .await
            .unwrap();
        let current = DeploymentLockDetails::from_resource(&record).unwrap();
        assert_eq!(current.locked_resource_details.id, "b-3");
        assert!(!locks.is_write_locked("i-1").await.unwrap());
    }

    #[tokio::test]
    async fn unlock_tolerates_missing_records_and_retries_transport_errors() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(&store);

        locks.unlock_deployment("never-locked").await.unwrap();

        locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-1"), None)
            .await
            .unwrap();
        store.fail_next_patches(2);
        locks.unlock_deployment("i-1").await.unwrap();

        let record = store
            .get(&DeploymentLocks::kind().key("i-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state(), ResourceState::Unlocked);
    }

    #[tokio::test]
    async fn observed_unlock_leaves_newer_lock_alone() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(&store);

        let first = locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-1"), None)
            .await
            .unwrap();
        locks.unlock_deployment("i-1").await.unwrap();
        locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-2"), None)
            .await
            .unwrap();

        assert!(!locks.unlock_observed(&first).await.unwrap());
        assert!(locks.is_write_locked("i-1").await.unwrap());

        let current = store
            .get(&DeploymentLocks::kind().key("i-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(locks.unlock_observed(&current).await.unwrap());
        assert!(!locks.is_write_locked("i-1").await.unwrap());
    }

    #[tokio::test]
    async fn observed_unlock_retries_transport_errors() {
        let store = Arc::new(InMemoryStore::new());
        let locks = locks(&store);
        let record = locks
            .lock_deployment("i-1", LockType::Write, backup_details("b-1"), None)
            .await
            .unwrap();

        store.fail_next_patches(2);
        assert!(locks.unlock_observed(&record).await.unwrap());
        assert!(!locks.is_write_locked("i-1").await.unwrap());
    }

    #[test]
    fn record_ttl_overrides_configured_ttl() {
        let mut settings = LockSettings::default();
        settings.ttl_secs.insert("backup".to_string(), 60);

        let mut details = DeploymentLockDetails {
            lock_type: LockType::Write,
            lock_time: Utc::now() - chrono::Duration::seconds(120),
            lock_ttl: None,
            locked_resource_details: backup_details("b-1"),
        };
        assert_eq!(details.ttl(&settings), Duration::from_secs(60));
        assert!(details.is_expired(&settings, Utc::now()));

        details.lock_ttl = Some(3600);
        assert!(!details.is_expired(&settings, Utc::now()));
    }

    #[test]
    fn lock_details_use_wire_names() {
        let details = DeploymentLockDetails {
            lock_type: LockType::Write,
            lock_time: Utc::now(),
            lock_ttl: Some(60),
            locked_resource_details: backup_details("b-1"),
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["lockType"], "write");
        assert_eq!(value["lockTTL"], 60);
        assert_eq!(value["lockedResourceDetails"]["type"], "defaultbackups");
        assert_eq!(value["lockedResourceDetails"]["operation"], "backup");
    }
}
